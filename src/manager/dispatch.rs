//! Inbound dispatch (§4.3 and sub-handlers §4.3.1-§4.3.3, §4.4-§4.9).
//!
//! One frame in, zero or more store writes / outbound replies out. Every
//! `FromRadio` variant and every `MeshPacket` port named in the spec gets
//! its own handler below; unknown ports and unhandled `FromRadio`
//! variants are logged and dropped, never treated as errors (§4.3.3).

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use prost::Message;

use crate::config::{DistanceUnit, WelcomeTarget};
use crate::protobuf::meshtastic_generated as pb;
use crate::push::PushNotification;
use crate::store::{
    ChannelRecord, ChannelRole, DeliveryState, MessageKind, MessageRecord, NeighborInfoRecord,
    NodeUpsert, PacketLogEntry, PositionSnapshot, RouteSegment, TelemetryKind, TelemetryRecord,
    TracerouteRecord,
};

use super::autoack::{self, AutoAckInput};
use super::autowelcome::{self, AutoWelcomeInput};
use super::device_state::clamp_last_heard;
use super::outbound::{self, apply_routing_ack, SessionPasskey};
use super::template::{self, TemplateContext};
use super::{geo, Manager};

/// Displacement between two fixes beyond which a node is flagged mobile
/// (§4.5 "recompute mobility"). Not named by the spec; chosen as a
/// reasonable walking-pace threshold (see DESIGN.md).
const MOBILITY_DISPLACEMENT_THRESHOLD_KM: f64 = 0.5;

/// RF telemetry (SNR/RSSI) is re-recorded at most this often unless the
/// value actually changes (§4.8 "append when changed or N minutes have
/// elapsed").
const RF_TELEMETRY_MAX_AGE_MINUTES: i64 = 10;

/// Keys a device ships with before it generates its own keypair —
/// publicly known, so advertising one offers no real PKI protection
/// (§4.3.1 "a static low-entropy-key set"). Illustrative placeholder
/// values; a real deployment sources this from the firmware's published
/// list (see DESIGN.md).
const KNOWN_LOW_ENTROPY_KEYS: &[&str] = &[
    "AQ==",
    "MCowBQYDK2VuAyEAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
];

fn is_known_low_entropy_key(base64_key: &str) -> bool {
    KNOWN_LOW_ENTROPY_KEYS.contains(&base64_key)
}

fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

fn position_degrees(position: &pb::Position) -> Option<(f64, f64)> {
    let lat = position.latitude_i? as f64 / 1e7;
    let lon = position.longitude_i? as f64 / 1e7;
    is_valid_coordinate(lat, lon).then_some((lat, lon))
}

fn packet_preview(portnum: i32, payload: &[u8]) -> String {
    if portnum == pb::PortNum::TextMessageApp as i32 {
        String::from_utf8_lossy(payload).chars().take(40).collect()
    } else {
        format!("<{} bytes>", payload.len())
    }
}

/// §4.5 smart-precision gating (§8 scenario 3): a later fix is accepted
/// over one already on file only if it's at least as precise, or the one
/// on file is stale (beyond the 12h staleness window). Pulled out as a
/// pure function so the boundary is directly testable.
fn accept_position_update(
    existing: Option<(u32, DateTime<Utc>)>,
    new_precision_bits: u32,
    now: DateTime<Utc>,
) -> bool {
    match existing {
        Some((prev_precision_bits, prev_updated_at)) => {
            new_precision_bits >= prev_precision_bits
                || (now - prev_updated_at) > chrono::Duration::hours(12)
        }
        None => true,
    }
}

/// Builds the forward traceroute path: responder, then every recorded
/// intermediate hop in wire order, then requester (§4.9, §8 scenario 6).
fn build_forward_path(responder: u32, route: &[u32], requester: u32) -> Vec<u32> {
    let mut path = vec![responder];
    path.extend(route.iter().copied());
    path.push(requester);
    path
}

/// Builds the return traceroute path: requester, then every recorded
/// intermediate hop in wire order, then responder (§4.9, §8 scenario 6).
fn build_return_path(requester: u32, route_back: &[u32], responder: u32) -> Vec<u32> {
    let mut path = vec![requester];
    path.extend(route_back.iter().copied());
    path.push(responder);
    path
}

/// `value/4 dB` SNR annotation rendered between two adjacent hops on a
/// traceroute path (§8 scenario 6).
fn format_snr_annotation(raw_snr: i32) -> String {
    format!(" ({:.1} dB)", raw_snr as f64 / 4.0)
}

fn error_reason_name(code: i32) -> &'static str {
    use pb::routing::Error as E;
    match E::try_from(code).unwrap_or(E::None) {
        E::None => "NONE",
        E::NoRoute => "NO_ROUTE",
        E::GotNak => "GOT_NAK",
        E::Timeout => "TIMEOUT",
        E::NoInterface => "NO_INTERFACE",
        E::MaxRetransmit => "MAX_RETRANSMIT",
        E::NoChannel => "NO_CHANNEL",
        E::TooLarge => "TOO_LARGE",
        E::NoResponse => "NO_RESPONSE",
        E::DutyCycleLimit => "DUTY_CYCLE_LIMIT",
        E::BadRequest => "BAD_REQUEST",
        E::NotAuthorized => "NOT_AUTHORIZED",
        E::PkiFailed => "PKI_FAILED",
        E::PkiUnknownPubkey => "PKI_UNKNOWN_PUBKEY",
        E::AdminBadSessionKey => "ADMIN_BAD_SESSION_KEY",
        E::AdminPublicKeyUnauthorized => "ADMIN_PUBLIC_KEY_UNAUTHORIZED",
        E::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
    }
}

impl Manager {
    /// Entry point called from [`Manager::run`] for every inbound frame,
    /// in wire order (§5). Capture and virtual-node fan-out see every
    /// frame, decodable or not; only a successfully decoded `FromRadio`
    /// reaches a handler.
    pub(super) async fn handle_frame(&mut self, frame: Bytes) {
        self.capture.push_if_capturing(frame.clone());
        self.virtual_node.broadcast(frame.clone()).await;

        let envelope = match pb::FromRadio::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to decode FromRadio frame: {}", e);
                return;
            }
        };

        match envelope.payload_variant {
            Some(pb::from_radio::PayloadVariant::MyInfo(info)) => self.handle_my_info(info).await,
            Some(pb::from_radio::PayloadVariant::NodeInfo(info)) => {
                self.handle_node_info_message(info).await
            }
            Some(pb::from_radio::PayloadVariant::Metadata(meta)) => {
                self.handle_device_metadata(meta).await
            }
            Some(pb::from_radio::PayloadVariant::Config(config)) => {
                self.device_state.merge_device_config(config)
            }
            Some(pb::from_radio::PayloadVariant::ModuleConfig(config)) => {
                self.device_state.merge_module_config(config)
            }
            Some(pb::from_radio::PayloadVariant::Channel(channel)) => {
                self.handle_channel(channel).await
            }
            Some(pb::from_radio::PayloadVariant::ConfigCompleteId(_)) => {
                self.handle_config_complete().await
            }
            Some(pb::from_radio::PayloadVariant::Packet(packet)) => {
                self.handle_mesh_packet(packet).await
            }
            _ => {}
        }
    }

    /// §4.2 first `MyNodeInfo`: seeds the local node and persists the
    /// `localNodeNum`/`localNodeId` settings the REST layer and a
    /// restarted process both rely on.
    async fn handle_my_info(&mut self, info: pb::MyNodeInfo) {
        let num = info.my_node_num;
        let node_id = format!("!{num:08x}");

        let stored_long_name = match self.store.get_node(num).await {
            Ok(Some(row)) => row.long_name,
            _ => None,
        };
        self.device_state.process_my_node_info(num, stored_long_name);
        self.device_state.process_reboot_count(info.reboot_count);
        self.outbound.set_local_node_num(num);

        if let Err(e) = self.store.set_setting("localNodeNum", &num.to_string()).await {
            warn!("failed to persist localNodeNum: {}", e);
        }
        if let Err(e) = self.store.set_setting("localNodeId", &node_id).await {
            warn!("failed to persist localNodeId: {}", e);
        }
    }

    async fn handle_device_metadata(&mut self, metadata: pb::DeviceMetadata) {
        if metadata.firmware_version.is_empty() {
            return;
        }
        self.device_state.process_device_metadata(metadata.firmware_version);
        self.sync_favorites_cache();
    }

    /// §4.3.1: the dump-time `NodeInfo` carries the full row (position,
    /// metrics, favorite flag) — richer than the `User`-only payload a
    /// live mesh packet on the nodeinfo port carries.
    async fn handle_node_info_message(&mut self, info: pb::NodeInfo) {
        let num = info.num;
        let now = Utc::now();
        let last_heard = clamp_last_heard(
            DateTime::<Utc>::from_timestamp(info.last_heard as i64, 0).unwrap_or(now),
        );

        let mut upsert = NodeUpsert {
            node_id: Some(format!("!{num:08x}")),
            last_heard: Some(last_heard),
            is_favorite: Some(info.is_favorite),
            hops_away: info.hops_away,
            ..NodeUpsert::new(num)
        };
        if info.snr != 0.0 {
            upsert.snr = Some(info.snr);
        }

        let mut long_name = None;
        let mut short_name = None;
        if let Some(user) = &info.user {
            if !user.long_name.is_empty() {
                long_name = Some(user.long_name.clone());
                upsert.long_name = Some(user.long_name.clone());
            }
            if !user.short_name.is_empty() {
                short_name = Some(user.short_name.clone());
                upsert.short_name = Some(user.short_name.clone());
            }
            if !user.public_key.is_empty() {
                let encoded = BASE64_STANDARD.encode(&user.public_key);
                upsert.is_known_low_entropy_key = Some(is_known_low_entropy_key(&encoded));
                upsert.public_key_base64 = Some(encoded);
                // No live MeshPacket accompanies a dump-time NodeInfo row, so
                // there's no wire-level `pki_encrypted` indicator to read —
                // a node that advertises a public key talks PKI (§4.3.1
                // "Track PKI-encryption status for the source node").
                upsert.pki_encrypted = Some(true);
            }
        }

        if let Err(e) = self.store.upsert_node(upsert).await {
            warn!("store error upserting node {num:08x}: {e}");
        }

        if let Some(position) = &info.position {
            self.write_position_telemetry_if_present(num, position).await;
        }
        if let Some(metrics) = &info.device_metrics {
            self.write_device_metrics_telemetry(num, metrics).await;
        }

        self.finish_node_identity(num, long_name, short_name).await;
    }

    /// §4.3.3 port 4: a live mesh packet carries only the `User`
    /// sub-message, not a full `NodeInfo` row. `pki_encrypted` comes from
    /// the carrying `MeshPacket`, not the `User` payload itself (§4.3.1
    /// "Track PKI-encryption status for the source node").
    async fn handle_nodeinfo_port(&mut self, from: u32, data: &pb::Data, pki_encrypted: bool) {
        let user = match pb::User::decode(data.payload.clone()) {
            Ok(user) => user,
            Err(e) => {
                warn!("failed to decode User payload from {from:08x}: {e}");
                return;
            }
        };

        let mut upsert = NodeUpsert {
            node_id: Some(format!("!{from:08x}")),
            last_heard: Some(Utc::now()),
            pki_encrypted: Some(pki_encrypted),
            ..NodeUpsert::new(from)
        };

        let mut long_name = None;
        let mut short_name = None;
        if !user.long_name.is_empty() {
            long_name = Some(user.long_name.clone());
            upsert.long_name = Some(user.long_name.clone());
        }
        if !user.short_name.is_empty() {
            short_name = Some(user.short_name.clone());
            upsert.short_name = Some(user.short_name.clone());
        }
        if !user.public_key.is_empty() {
            let encoded = BASE64_STANDARD.encode(&user.public_key);
            upsert.is_known_low_entropy_key = Some(is_known_low_entropy_key(&encoded));
            upsert.public_key_base64 = Some(encoded);
        }

        if let Err(e) = self.store.upsert_node(upsert).await {
            warn!("store error upserting node {from:08x}: {e}");
        }

        self.finish_node_identity(from, long_name, short_name).await;
    }

    /// Shared tail of both node-identity paths: adopt local names (I3)
    /// and, for anyone else, consider an auto-welcome reply (§4.10, I8).
    async fn finish_node_identity(
        &mut self,
        num: u32,
        long_name: Option<String>,
        short_name: Option<String>,
    ) {
        if self.device_state.is_local_node(num) {
            if let (Some(long_name), Some(short_name)) = (long_name.clone(), short_name.clone()) {
                self.device_state.adopt_local_names(long_name, short_name);
            }
            return;
        }
        self.maybe_send_welcome(num, long_name, short_name).await;
    }

    async fn maybe_send_welcome(
        &mut self,
        num: u32,
        long_name: Option<String>,
        short_name: Option<String>,
    ) {
        let already_welcomed = matches!(
            self.store.get_node(num).await,
            Ok(Some(row)) if row.welcomed_at.is_some()
        );
        let input = AutoWelcomeInput {
            is_local_node: false,
            already_welcomed,
            long_name,
            short_name,
        };
        let ctx = self.base_template_context().await;
        let Some(reply) = autowelcome::evaluate(&self.config.autowelcome, &input, ctx) else {
            return;
        };

        let (channel, destination) = match reply.target {
            WelcomeTarget::Dm => (-1, Some(num)),
            WelcomeTarget::Channel => (0, None),
        };
        match self.outbound.send_text(&reply.text, channel, destination, None, None).await {
            Ok(_) => {
                let upsert = NodeUpsert {
                    welcomed_at: Some(Utc::now()),
                    ..NodeUpsert::new(num)
                };
                if let Err(e) = self.store.upsert_node(upsert).await {
                    warn!("store error marking node {num:08x} welcomed: {e}");
                }
            }
            Err(e) => warn!("auto-welcome send failed for {num:08x}: {e}"),
        }
    }

    /// §4.3.2: normalizes the role on ingestion (I5 — index 0 is always
    /// primary, 1-7 never are) and ignores frames that name neither a
    /// settings change nor the primary channel.
    async fn handle_channel(&mut self, channel: pb::Channel) {
        let index = channel.index as u8;
        let settings = channel.settings;
        let name = settings
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty());
        let psk = settings.as_ref().map(|s| s.psk.clone()).filter(|p| !p.is_empty());

        let role = match pb::channel::Role::try_from(channel.role).unwrap_or(pb::channel::Role::Disabled) {
            _ if index == 0 => ChannelRole::Primary,
            pb::channel::Role::Primary => ChannelRole::Secondary,
            pb::channel::Role::Secondary => ChannelRole::Secondary,
            pb::channel::Role::Disabled => ChannelRole::Disabled,
        };

        let should_persist = name.is_some() || psk.is_some() || role != ChannelRole::Disabled;
        if !should_persist {
            return;
        }

        let psk_base64 = psk.map(|bytes| BASE64_STANDARD.encode(&bytes));

        if let Err(e) = self
            .store
            .upsert_channel(ChannelRecord {
                index,
                name,
                psk_base64,
                role,
                position_precision: None,
            })
            .await
        {
            warn!("store error upserting channel {index}: {e}");
        }
    }

    /// §4.14: the init-capture sequence is done, buffer freezes, and the
    /// caller-supplied completion hook (if any) fires.
    async fn handle_config_complete(&mut self) {
        self.capture.freeze();
        if let Some(callback) = self.on_config_capture_complete.clone() {
            callback();
        }
    }

    /// §4.3.3: decode, packet-log, then hand off by port. Ports with no
    /// named handler are logged and dropped, never treated as errors.
    async fn handle_mesh_packet(&mut self, packet: pb::MeshPacket) {
        let from = packet.from;
        let to = packet.to;
        let packet_id = packet.id;
        let channel = packet.channel as i32;
        let hop_start = (packet.hop_start != 0).then_some(packet.hop_start);
        let hop_limit = (packet.hop_limit != 0).then_some(packet.hop_limit);
        let rx_time = packet.rx_time;
        let pki_encrypted = packet.pki_encrypted;

        self.touch_node_transmission_metrics(from, packet.rx_snr, packet.rx_rssi, pki_encrypted)
            .await;

        let Some(pb::mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant else {
            return; // encrypted payload we hold no channel key for
        };

        if self.config.packet_log.enabled {
            let to_num = (to != outbound::BROADCAST_NUM).then_some(to);
            let entry = PacketLogEntry {
                from_num: from,
                to_num,
                port: data.portnum as u32,
                preview: packet_preview(data.portnum, &data.payload),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.log_packet(entry).await {
                warn!("store error logging packet: {e}");
            }
        }

        let port = pb::PortNum::try_from(data.portnum).unwrap_or(pb::PortNum::UnknownApp);
        match port {
            pb::PortNum::TextMessageApp => {
                self.handle_text(from, to, channel, packet_id, hop_start, hop_limit, rx_time, &data)
                    .await
            }
            pb::PortNum::PositionApp => self.handle_position_packet(from, &data).await,
            pb::PortNum::RoutingApp => self.handle_routing(from, &data).await,
            pb::PortNum::AdminApp => self.handle_admin(&data).await,
            pb::PortNum::TelemetryApp => {
                self.handle_telemetry(from, &data, packet.rx_snr, packet.rx_rssi).await
            }
            pb::PortNum::TracerouteApp => self.handle_traceroute(from, to, &data).await,
            pb::PortNum::NodeinfoApp => self.handle_nodeinfo_port(from, &data, pki_encrypted).await,
            pb::PortNum::NeighborinfoApp => self.handle_neighbor_info(from, &data).await,
            other => debug!("ignoring packet on unhandled port {:?}", other),
        }
    }

    /// Every carrier packet touches `lastHeard`/SNR/RSSI on its sender,
    /// independent of whatever port it's carrying (§4.3.3), and records
    /// whether this packet rode in under PKI encryption rather than a
    /// channel PSK (§4.3.1 "Track PKI-encryption status for the source
    /// node") — the most direct wire-level signal available for it.
    async fn touch_node_transmission_metrics(&mut self, from: u32, snr: f32, rssi: i32, pki_encrypted: bool) {
        if from == 0 {
            return;
        }
        let upsert = NodeUpsert {
            last_heard: Some(Utc::now()),
            snr: (snr != 0.0).then_some(snr),
            rssi: (rssi != 0).then_some(rssi),
            pki_encrypted: Some(pki_encrypted),
            ..NodeUpsert::new(from)
        };
        if let Err(e) = self.store.upsert_node(upsert).await {
            warn!("store error touching node {from:08x} transmission metrics: {e}");
        }
    }

    /// §4.4: persist the inbound text, notify, and — if it's not our own
    /// echo — consider an auto-ack.
    #[allow(clippy::too_many_arguments)]
    async fn handle_text(
        &mut self,
        from: u32,
        to: u32,
        packet_channel: i32,
        packet_id: u32,
        hop_start: Option<u32>,
        hop_limit: Option<u32>,
        rx_time: u32,
        data: &pb::Data,
    ) {
        let text = String::from_utf8_lossy(&data.payload).into_owned();
        let is_broadcast = to == outbound::BROADCAST_NUM;
        let wire_channel = if is_broadcast { packet_channel } else { -1 };
        let reply_id = (data.reply_id != 0).then_some(data.reply_id);
        let emoji = (data.emoji != 0).then_some(data.emoji);
        let is_from_local = self.device_state.is_local_node(from);

        self.ensure_node_exists(from).await;

        let record = MessageRecord {
            id: format!("{from}_{packet_id}"),
            kind: MessageKind::Text,
            request_id: None,
            from_num: from,
            to_num: (!is_broadcast).then_some(to),
            channel: wire_channel,
            text: text.clone(),
            reply_id,
            emoji,
            hop_start,
            hop_limit,
            want_ack: false,
            delivery_state: DeliveryState::Delivered,
            is_read: false,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.insert_message(record).await {
            warn!("store error inserting inbound message from {from:08x}: {e}");
        }

        self.push
            .notify(PushNotification {
                from_num: from,
                channel: wire_channel,
                title: "Message".to_string(),
                body: text.clone(),
            })
            .await;

        if !is_from_local {
            self.maybe_auto_ack(from, wire_channel, packet_id, &text, hop_start, hop_limit, rx_time)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn maybe_auto_ack(
        &mut self,
        from: u32,
        channel: i32,
        packet_id: u32,
        text: &str,
        hop_start: Option<u32>,
        hop_limit: Option<u32>,
        rx_time: u32,
    ) {
        let input = AutoAckInput {
            text,
            channel,
            is_from_local_node: false,
            packet_id,
        };
        let mut ctx = self.sender_template_context(from).await;
        ctx.hop_start = hop_start;
        ctx.hop_limit = hop_limit;
        ctx.packet_timestamp = (rx_time != 0)
            .then(|| DateTime::<Utc>::from_timestamp(rx_time as i64, 0))
            .flatten();

        let Some(reply) = autoack::evaluate(&self.config.autoack, &mut self.autoack_cache, &input, ctx)
        else {
            return;
        };
        let destination = (reply.channel == -1).then_some(from);
        if let Err(e) = self
            .outbound
            .send_text(&reply.text, reply.channel, destination, reply.reply_id, None)
            .await
        {
            warn!("auto-ack reply to {from:08x} failed: {e}");
        }
    }

    async fn ensure_node_exists(&mut self, num: u32) {
        if matches!(self.store.get_node(num).await, Ok(None)) {
            let upsert = NodeUpsert {
                node_id: Some(format!("!{num:08x}")),
                last_heard: Some(Utc::now()),
                ..NodeUpsert::new(num)
            };
            if let Err(e) = self.store.upsert_node(upsert).await {
                warn!("store error creating placeholder node {num:08x}: {e}");
            }
        }
    }

    async fn write_position_telemetry_if_present(&mut self, num: u32, position: &pb::Position) {
        let Some((lat, lon)) = position_degrees(position) else {
            return;
        };
        let now = Utc::now();
        let _ = self
            .store
            .insert_telemetry(TelemetryRecord {
                node_num: num,
                kind: TelemetryKind::Latitude,
                value: lat,
                timestamp: now,
            })
            .await;
        let _ = self
            .store
            .insert_telemetry(TelemetryRecord {
                node_num: num,
                kind: TelemetryKind::Longitude,
                value: lon,
                timestamp: now,
            })
            .await;
        if let Some(altitude) = position.altitude {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::Altitude,
                    value: altitude as f64,
                    timestamp: now,
                })
                .await;
        }
    }

    /// §4.5: smart-precision gating (a later fix is only accepted if it's
    /// at least as precise as the one on file, or the one on file is
    /// stale), then mobility recompute against the prior fix.
    async fn handle_position_packet(&mut self, from: u32, data: &pb::Data) {
        let position = match pb::Position::decode(data.payload.clone()) {
            Ok(position) => position,
            Err(e) => {
                warn!("failed to decode Position payload from {from:08x}: {e}");
                return;
            }
        };
        let Some((lat, lon)) = position_degrees(&position) else {
            debug!("rejecting invalid/missing position from {from:08x}");
            return;
        };

        let existing = match self.store.get_node(from).await {
            Ok(Some(row)) => {
                let is_mobile = row.is_mobile;
                row.position.map(|position| (position, is_mobile))
            }
            _ => None,
        };

        let precision_bits = position.precision_bits;
        let accept = accept_position_update(
            existing.as_ref().map(|(prev, _)| (prev.precision_bits, prev.updated_at)),
            precision_bits,
            Utc::now(),
        );
        if !accept {
            return;
        }

        let is_mobile = match &existing {
            Some((prev, prev_mobile)) => {
                let displacement_km = geo::haversine_km(prev.latitude, prev.longitude, lat, lon);
                displacement_km > MOBILITY_DISPLACEMENT_THRESHOLD_KM || *prev_mobile
            }
            None => false,
        };

        let snapshot = PositionSnapshot {
            latitude: lat,
            longitude: lon,
            altitude: position.altitude,
            precision_bits,
            updated_at: Utc::now(),
        };
        let upsert = NodeUpsert {
            position: Some(snapshot),
            last_heard: Some(Utc::now()),
            ..NodeUpsert::new(from)
        };
        if let Err(e) = self.store.upsert_node(upsert).await {
            warn!("store error writing position for {from:08x}: {e}");
        }
        if let Err(e) = self.store.update_node_mobility(from, is_mobile).await {
            warn!("store error updating mobility for {from:08x}: {e}");
        }

        let now = Utc::now();
        let _ = self
            .store
            .insert_telemetry(TelemetryRecord {
                node_num: from,
                kind: TelemetryKind::Latitude,
                value: lat,
                timestamp: now,
            })
            .await;
        let _ = self
            .store
            .insert_telemetry(TelemetryRecord {
                node_num: from,
                kind: TelemetryKind::Longitude,
                value: lon,
                timestamp: now,
            })
            .await;
        if let Some(altitude) = position.altitude {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: from,
                    kind: TelemetryKind::Altitude,
                    value: altitude as f64,
                    timestamp: now,
                })
                .await;
        }
    }

    /// §4.6: apply a routing ACK/NAK to the delivery tracker. Only
    /// frames carrying a nonzero `requestId` and an `errorReason`
    /// variant are actionable; everything else is ignored.
    async fn handle_routing(&mut self, from: u32, data: &pb::Data) {
        let routing = match pb::Routing::decode(data.payload.clone()) {
            Ok(routing) => routing,
            Err(e) => {
                warn!("failed to decode Routing payload from {from:08x}: {e}");
                return;
            }
        };
        if data.request_id == 0 {
            return;
        }
        let Some(pb::routing::Variant::ErrorReason(code)) = routing.variant else {
            return;
        };
        let error_reason_is_none = code == pb::routing::Error::None as i32;
        if !error_reason_is_none {
            debug!("routing nak from {from:08x}: {}", error_reason_name(code));
        }
        let Some(local) = self.device_state.get_local() else {
            return;
        };
        if let Err(e) =
            apply_routing_ack(self.store.as_ref(), local.num, data.request_id, from, error_reason_is_none)
                .await
        {
            warn!("error applying routing ack for request {}: {e}", data.request_id);
        }
    }

    /// §4.7: an admin frame carrying `sessionPasskey` completes every
    /// outstanding `requestSessionPasskey()` waiter.
    async fn handle_admin(&mut self, data: &pb::Data) {
        let admin = match pb::AdminMessage::decode(data.payload.clone()) {
            Ok(admin) => admin,
            Err(e) => {
                warn!("failed to decode AdminMessage: {e}");
                return;
            }
        };
        if admin.session_passkey.is_empty() {
            return;
        }
        let passkey = SessionPasskey::new(admin.session_passkey.to_vec());
        let waiters = std::mem::take(
            &mut *self.passkey_waiters.lock().expect("passkey waiters mutex poisoned"),
        );
        for waiter in waiters {
            let _ = waiter.send(passkey.clone());
        }
        self.session_passkey = Some(passkey);
    }

    /// §4.8: device/environment/power metrics land as typed telemetry
    /// rows; the carrier packet's SNR/RSSI are appended too, throttled
    /// to avoid a row per packet.
    async fn handle_telemetry(
        &mut self,
        from: u32,
        data: &pb::Data,
        packet_snr: f32,
        packet_rssi: i32,
    ) {
        let telemetry = match pb::Telemetry::decode(data.payload.clone()) {
            Ok(telemetry) => telemetry,
            Err(e) => {
                warn!("failed to decode Telemetry from {from:08x}: {e}");
                return;
            }
        };

        match telemetry.variant {
            Some(pb::telemetry::Variant::DeviceMetrics(metrics)) => {
                self.write_device_metrics_telemetry(from, &metrics).await;
            }
            Some(pb::telemetry::Variant::EnvironmentMetrics(env)) => {
                self.write_environment_metrics_telemetry(from, &env).await;
            }
            Some(pb::telemetry::Variant::PowerMetrics(power)) => {
                self.write_power_metrics_telemetry(from, &power).await;
            }
            _ => {}
        }

        self.maybe_record_rf_telemetry(from, packet_snr, packet_rssi).await;
    }

    async fn write_device_metrics_telemetry(&mut self, num: u32, metrics: &pb::DeviceMetrics) {
        let now = Utc::now();
        if let Some(battery) = metrics.battery_level {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::BatteryLevel,
                    value: battery as f64,
                    timestamp: now,
                })
                .await;
        }
        if let Some(voltage) = metrics.voltage {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::Voltage,
                    value: voltage as f64,
                    timestamp: now,
                })
                .await;
        }
        if let Some(util) = metrics.channel_utilization {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::ChannelUtilization,
                    value: util as f64,
                    timestamp: now,
                })
                .await;
        }
        if let Some(air_util_tx) = metrics.air_util_tx {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::AirUtilTx,
                    value: air_util_tx as f64,
                    timestamp: now,
                })
                .await;
        }
    }

    async fn write_environment_metrics_telemetry(&mut self, num: u32, env: &pb::EnvironmentMetrics) {
        let now = Utc::now();
        if let Some(temperature) = env.temperature {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::Temperature,
                    value: temperature as f64,
                    timestamp: now,
                })
                .await;
        }
        if let Some(humidity) = env.relative_humidity {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::Humidity,
                    value: humidity as f64,
                    timestamp: now,
                })
                .await;
        }
        if let Some(pressure) = env.barometric_pressure {
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: num,
                    kind: TelemetryKind::Pressure,
                    value: pressure as f64,
                    timestamp: now,
                })
                .await;
        }
    }

    async fn write_power_metrics_telemetry(&mut self, num: u32, power: &pb::PowerMetrics) {
        let now = Utc::now();
        let channels: [(Option<f32>, Option<f32>, u8); 8] = [
            (power.ch1_voltage, power.ch1_current, 1),
            (power.ch2_voltage, power.ch2_current, 2),
            (power.ch3_voltage, power.ch3_current, 3),
            (power.ch4_voltage, power.ch4_current, 4),
            (power.ch5_voltage, power.ch5_current, 5),
            (power.ch6_voltage, power.ch6_current, 6),
            (power.ch7_voltage, power.ch7_current, 7),
            (power.ch8_voltage, power.ch8_current, 8),
        ];
        for (voltage, current, index) in channels {
            if let Some(voltage) = voltage {
                let _ = self
                    .store
                    .insert_telemetry(TelemetryRecord {
                        node_num: num,
                        kind: TelemetryKind::ChannelVoltage(index),
                        value: voltage as f64,
                        timestamp: now,
                    })
                    .await;
            }
            if let Some(current) = current {
                let _ = self
                    .store
                    .insert_telemetry(TelemetryRecord {
                        node_num: num,
                        kind: TelemetryKind::ChannelCurrent(index),
                        value: current as f64,
                        timestamp: now,
                    })
                    .await;
            }
        }
    }

    async fn maybe_record_rf_telemetry(&mut self, num: u32, snr: f32, rssi: i32) {
        let now = Utc::now();
        if snr != 0.0 {
            let last = self
                .store
                .get_latest_telemetry_for_type(num, TelemetryKind::Snr)
                .await
                .ok()
                .flatten();
            let should_write = match &last {
                None => true,
                Some(row) => {
                    (row.value - snr as f64).abs() > f64::EPSILON
                        || (now - row.timestamp) > chrono::Duration::minutes(RF_TELEMETRY_MAX_AGE_MINUTES)
                }
            };
            if should_write {
                let _ = self
                    .store
                    .insert_telemetry(TelemetryRecord {
                        node_num: num,
                        kind: TelemetryKind::Snr,
                        value: snr as f64,
                        timestamp: now,
                    })
                    .await;
            }
        }
        if rssi != 0 {
            let last = self
                .store
                .get_latest_telemetry_for_type(num, TelemetryKind::Rssi)
                .await
                .ok()
                .flatten();
            let should_write = match &last {
                None => true,
                Some(row) => {
                    row.value as i32 != rssi
                        || (now - row.timestamp) > chrono::Duration::minutes(RF_TELEMETRY_MAX_AGE_MINUTES)
                }
            };
            if should_write {
                let _ = self
                    .store
                    .insert_telemetry(TelemetryRecord {
                        node_num: num,
                        kind: TelemetryKind::Rssi,
                        value: rssi as f64,
                        timestamp: now,
                    })
                    .await;
            }
        }
    }

    /// §4.9: persist the raw traceroute, fold both paths' hops into
    /// route-segment distances, estimate GPS-less intermediates, render
    /// a human-readable summary, and deliver it as a traceroute-typed
    /// message plus a push notification.
    async fn handle_traceroute(&mut self, from: u32, to: u32, data: &pb::Data) {
        let route = match pb::RouteDiscovery::decode(data.payload.clone()) {
            Ok(route) => route,
            Err(e) => {
                warn!("failed to decode RouteDiscovery from {from:08x}: {e}");
                return;
            }
        };

        // The frame travels from whoever answered (`from`) back to
        // whoever asked (`to`) — the reverse of the logical request.
        let responder = from;
        let requester = to;

        let forward_path = build_forward_path(responder, &route.route, requester);
        let return_path = build_return_path(requester, &route.route_back, responder);

        if let Err(e) = self
            .store
            .insert_traceroute(TracerouteRecord {
                responder_num: responder,
                requester_num: requester,
                route: route.route.clone(),
                route_back: route.route_back.clone(),
                snr_towards: route.snr_towards.clone(),
                snr_back: route.snr_back.clone(),
                timestamp: Utc::now(),
            })
            .await
        {
            warn!("store error inserting traceroute: {e}");
        }

        self.update_route_segments(&forward_path).await;
        self.update_route_segments(&return_path).await;
        self.estimate_intermediate_positions(&forward_path).await;
        self.estimate_intermediate_positions(&return_path).await;

        let rendered = self
            .render_traceroute(&forward_path, &return_path, &route.snr_towards, &route.snr_back)
            .await;

        let record = MessageRecord {
            id: format!("{responder}_{}", data.request_id.max(1)),
            kind: MessageKind::Traceroute,
            request_id: (data.request_id != 0).then_some(data.request_id),
            from_num: responder,
            to_num: Some(requester),
            channel: -1,
            text: rendered.clone(),
            reply_id: None,
            emoji: None,
            hop_start: None,
            hop_limit: None,
            want_ack: false,
            delivery_state: DeliveryState::Delivered,
            is_read: false,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.insert_message(record).await {
            warn!("store error inserting traceroute message: {e}");
        }

        self.push
            .notify(PushNotification {
                from_num: responder,
                channel: -1,
                title: "Traceroute".to_string(),
                body: rendered,
            })
            .await;
    }

    async fn update_route_segments(&mut self, path: &[u32]) {
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let pos_a = self.store.get_node(a).await.ok().flatten().and_then(|n| n.position);
            let pos_b = self.store.get_node(b).await.ok().flatten().and_then(|n| n.position);
            let (Some(pos_a), Some(pos_b)) = (pos_a, pos_b) else {
                continue;
            };
            let distance_km = geo::haversine_km(pos_a.latitude, pos_a.longitude, pos_b.latitude, pos_b.longitude);

            if let Err(e) = self
                .store
                .insert_route_segment(RouteSegment {
                    node_a: a,
                    node_b: b,
                    distance_km,
                    is_record_holder: false,
                    updated_at: Utc::now(),
                })
                .await
            {
                warn!("store error inserting route segment {a:08x}-{b:08x}: {e}");
            }

            if distance_km > self.longest_segment_km {
                self.longest_segment_km = distance_km;
                if let Err(e) = self.store.update_record_holder_segment(a, b).await {
                    warn!("store error updating record-holder segment: {e}");
                }
            }
        }
    }

    /// §4.9: a hop with no GPS of its own gets the great-circle midpoint
    /// of its two path neighbors, if both of those have a fix.
    async fn estimate_intermediate_positions(&mut self, path: &[u32]) {
        if path.len() < 3 {
            return;
        }
        for window in path.windows(3) {
            let (left, mid, right) = (window[0], window[1], window[2]);
            let mid_has_position = matches!(
                self.store.get_node(mid).await,
                Ok(Some(row)) if row.position.is_some()
            );
            if mid_has_position {
                continue;
            }
            let left_pos = self.store.get_node(left).await.ok().flatten().and_then(|n| n.position);
            let right_pos = self.store.get_node(right).await.ok().flatten().and_then(|n| n.position);
            let (Some(left_pos), Some(right_pos)) = (left_pos, right_pos) else {
                continue;
            };
            let (lat, lon) = geo::midpoint(left_pos.latitude, left_pos.longitude, right_pos.latitude, right_pos.longitude);
            let now = Utc::now();
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: mid,
                    kind: TelemetryKind::EstimatedLatitude,
                    value: lat,
                    timestamp: now,
                })
                .await;
            let _ = self
                .store
                .insert_telemetry(TelemetryRecord {
                    node_num: mid,
                    kind: TelemetryKind::EstimatedLongitude,
                    value: lon,
                    timestamp: now,
                })
                .await;
        }
    }

    async fn render_traceroute(
        &self,
        forward: &[u32],
        back: &[u32],
        snr_towards: &[i32],
        snr_back: &[i32],
    ) -> String {
        let unit = self.config.limits.distance_unit;
        format!(
            "Forward path:\n{}\nReturn path:\n{}",
            self.render_path(forward, snr_towards, unit).await,
            self.render_path(back, snr_back, unit).await,
        )
    }

    async fn render_path(&self, path: &[u32], snrs: &[i32], unit: DistanceUnit) -> String {
        let mut lines = Vec::with_capacity(path.len());
        for (i, &num) in path.iter().enumerate() {
            let mut line = format!("  !{num:08x}");
            if i > 0 {
                if let Some(&raw_snr) = snrs.get(i - 1) {
                    line.push_str(&format_snr_annotation(raw_snr));
                }
                let prev = path[i - 1];
                let prev_pos = self.store.get_node(prev).await.ok().flatten().and_then(|n| n.position);
                let here_pos = self.store.get_node(num).await.ok().flatten().and_then(|n| n.position);
                if let (Some(a), Some(b)) = (prev_pos, here_pos) {
                    let km = geo::haversine_km(a.latitude, a.longitude, b.latitude, b.longitude);
                    let (value, suffix) = match unit {
                        DistanceUnit::Km => (km, "km"),
                        DistanceUnit::Mi => (geo::km_to_mi(km), "mi"),
                    };
                    line.push_str(&format!(" [{value:.2} {suffix}]"));
                }
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// §4.3.3 port 71: per-neighbor SNR rows, plus placeholder nodes for
    /// any neighbor this store hasn't seen directly yet.
    async fn handle_neighbor_info(&mut self, from: u32, data: &pb::Data) {
        let info = match pb::NeighborInfo::decode(data.payload.clone()) {
            Ok(info) => info,
            Err(e) => {
                warn!("failed to decode NeighborInfo from {from:08x}: {e}");
                return;
            }
        };

        let now = Utc::now();
        let sender_hops = self
            .store
            .get_node(from)
            .await
            .ok()
            .flatten()
            .and_then(|n| n.hops_away)
            .unwrap_or(0);

        for neighbor in &info.neighbors {
            if let Err(e) = self
                .store
                .save_neighbor_info(NeighborInfoRecord {
                    node_num: from,
                    neighbor_num: neighbor.node_id,
                    snr: (neighbor.snr != 0.0).then_some(neighbor.snr),
                    timestamp: now,
                })
                .await
            {
                warn!("store error saving neighbor info {from:08x}->{:08x}: {e}", neighbor.node_id);
            }

            if matches!(self.store.get_node(neighbor.node_id).await, Ok(None)) {
                let upsert = NodeUpsert {
                    node_id: Some(format!("!{:08x}", neighbor.node_id)),
                    long_name: Some(format!("Node {:08x}", neighbor.node_id)),
                    hops_away: Some(sender_hops + 1),
                    last_heard: Some(now),
                    ..NodeUpsert::new(neighbor.node_id)
                };
                if let Err(e) = self.store.upsert_node(upsert).await {
                    warn!("store error creating placeholder neighbor {:08x}: {e}", neighbor.node_id);
                }
            }
        }
    }

    /// Context for announcement/auto-ack/auto-welcome messages that
    /// don't need a specific sender's identity (§4.10 shared tokens).
    pub(super) async fn base_template_context(&self) -> TemplateContext {
        let uptime_seconds = (Utc::now() - self.started_at).num_seconds();
        template::build_context(
            self.store.as_ref(),
            self.config.limits.max_node_age_hours,
            self.config.limits.distance_unit,
            env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            self.enabled_feature_emojis(),
        )
        .await
    }

    async fn sender_template_context(&self, num: u32) -> TemplateContext {
        let mut ctx = self.base_template_context().await;
        ctx.node_id = format!("!{num:08x}");
        if let Ok(Some(row)) = self.store.get_node(num).await {
            ctx.long_name = row.long_name.unwrap_or_default();
            ctx.short_name = row.short_name.unwrap_or_default();
        }
        ctx
    }

    fn enabled_feature_emojis(&self) -> Vec<String> {
        template::enabled_feature_emojis(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_existing_position_always_accepts() {
        assert!(accept_position_update(None, 10, Utc::now()));
    }

    #[test]
    fn less_precise_recent_fix_is_rejected() {
        let now = Utc::now();
        let existing = (14, now - chrono::Duration::minutes(1));
        assert!(!accept_position_update(Some(existing), 10, now));
    }

    #[test]
    fn more_precise_fix_is_accepted() {
        let now = Utc::now();
        let existing = (14, now - chrono::Duration::minutes(1));
        assert!(accept_position_update(Some(existing), 16, now));
    }

    #[test]
    fn stale_existing_fix_accepts_even_a_less_precise_update() {
        let now = Utc::now();
        let existing = (14, now - chrono::Duration::hours(13));
        assert!(accept_position_update(Some(existing), 10, now));
    }

    #[test]
    fn traceroute_render_scenario_builds_expected_paths() {
        // §8 scenario 6: responder 100 -> intermediates [300] -> requester 200.
        let forward = build_forward_path(100, &[300], 200);
        let back = build_return_path(200, &[300], 100);

        assert_eq!(forward.first(), Some(&100));
        assert_eq!(forward.last(), Some(&200));
        assert_eq!(forward.iter().filter(|&&n| n == 300).count(), 1);

        assert_eq!(back.first(), Some(&200));
        assert_eq!(back.last(), Some(&100));
    }

    #[test]
    fn snr_annotation_divides_by_four() {
        assert_eq!(format_snr_annotation(-5), " (-1.3 dB)");
        assert_eq!(format_snr_annotation(10), " (2.5 dB)");
        assert_eq!(format_snr_annotation(8), " (2.0 dB)");
        assert_eq!(format_snr_annotation(-3), " (-0.8 dB)");
    }

    #[test]
    fn is_known_low_entropy_key_matches_the_well_known_placeholder() {
        assert!(is_known_low_entropy_key("AQ=="));
        assert!(!is_known_low_entropy_key("some-real-base64-key=="));
    }

    #[test]
    fn position_degrees_rejects_out_of_range_coordinates() {
        assert!(!is_valid_coordinate(91.0, 0.0));
        assert!(!is_valid_coordinate(0.0, 181.0));
        assert!(is_valid_coordinate(45.0, -120.0));
    }
}
