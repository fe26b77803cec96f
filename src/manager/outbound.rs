//! Outbound command surface and delivery tracker (§4.13, §4.6, §4.7).
//!
//! Builds `ToRadio` packets the same way the template's
//! `send_text_packet` did (`Data` payload wrapped in a `MeshPacket`,
//! wrapped in `ToRadio`, length-prefixed and written to the wire) and
//! generalizes it to every admin operation §6 names, plus the
//! delivery-state machine that advances outbound records as routing
//! ACK/NAK frames arrive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use prost::Message;
use rand::Rng;
use uuid::Uuid;

use crate::protobuf::meshtastic_generated as pb;
use crate::store::{DeliveryState, MeshStore, MessageKind, MessageRecord};
use crate::transport::TransportHandle;

pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;
const SESSION_PASSKEY_TTL: Duration = Duration::from_secs(290);
const SESSION_PASSKEY_WAIT: Duration = Duration::from_secs(3);
/// Firmware caps a single text payload well under the ~230-byte frame
/// budget; 200 leaves room for the surrounding `MeshPacket`/`ToRadio`
/// envelope (§2 "text send with split support").
const MAX_TEXT_PAYLOAD_BYTES: usize = 200;

/// Greedily packs whitespace-delimited words into chunks no larger than
/// `max_bytes`. A single word longer than `max_bytes` is hard-split on a
/// char boundary rather than dropped. Always returns at least one chunk,
/// even for empty input, so callers never have to special-case "no
/// split needed".
fn split_text(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate_len = current.len() + word.len() + usize::from(!current.is_empty());
        if candidate_len > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if word.len() > max_bytes {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = word;
            while rest.len() > max_bytes {
                let mut split_at = max_bytes;
                while !rest.is_char_boundary(split_at) {
                    split_at -= 1;
                }
                chunks.push(rest[..split_at].to_string());
                rest = &rest[split_at..];
            }
            current.push_str(rest);
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// §3 `SessionPasskey`.
#[derive(Debug, Clone)]
pub struct SessionPasskey {
    pub bytes: Vec<u8>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl SessionPasskey {
    pub fn new(bytes: Vec<u8>) -> Self {
        SessionPasskey {
            bytes,
            expires_at: chrono::Utc::now() + chrono::Duration::from_std(SESSION_PASSKEY_TTL).unwrap(),
        }
    }

    pub fn is_expired(&self) -> bool {
        chrono::Utc::now() >= self.expires_at
    }
}

/// Generates a fresh non-zero 32-bit request id per outbound packet
/// (§4.13, glossary "requestId").
fn next_request_id() -> u32 {
    loop {
        let id: u32 = rand::thread_rng().gen();
        if id != 0 {
            return id;
        }
    }
}

pub struct OutboundSurface {
    transport: TransportHandle,
    store: Arc<dyn MeshStore>,
    local_node_num: AtomicU32,
}

impl OutboundSurface {
    pub fn new(transport: TransportHandle, store: Arc<dyn MeshStore>) -> Self {
        OutboundSurface {
            transport,
            store,
            local_node_num: AtomicU32::new(0),
        }
    }

    pub fn set_local_node_num(&self, num: u32) {
        self.local_node_num.store(num, Ordering::SeqCst);
    }

    fn local_node_num(&self) -> Result<u32> {
        let num = self.local_node_num.load(Ordering::SeqCst);
        if num == 0 {
            Err(anyhow!("local node number not yet known"))
        } else {
            Ok(num)
        }
    }

    async fn send_to_radio(&self, payload_variant: pb::to_radio::PayloadVariant) -> Result<()> {
        let message = pb::ToRadio {
            payload_variant: Some(payload_variant),
        };
        let mut buf = Vec::with_capacity(128);
        message.encode(&mut buf)?;
        self.transport.send(Bytes::from(buf)).await
    }

    fn build_admin_packet(&self, admin: pb::AdminMessage, target: u32) -> Result<pb::MeshPacket> {
        let from = self.local_node_num()?;
        let mut payload = Vec::new();
        admin.encode(&mut payload)?;
        let data = pb::Data {
            portnum: pb::PortNum::AdminApp as i32,
            payload: Bytes::from(payload),
            want_response: false,
            dest: 0,
            source: 0,
            request_id: 0,
            reply_id: 0,
            emoji: 0,
            ..Default::default()
        };
        Ok(pb::MeshPacket {
            from,
            to: target,
            channel: 0,
            payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
            id: next_request_id(),
            hop_limit: 3,
            want_ack: false,
            priority: 0,
            ..Default::default()
        })
    }

    async fn send_admin(&self, admin: pb::AdminMessage, target: u32) -> Result<()> {
        let packet = self.build_admin_packet(admin, target)?;
        self.send_to_radio(pb::to_radio::PayloadVariant::Packet(packet)).await
    }

    /// `sendText` (§4.13, §2 "text send with split support"): splits
    /// `text` into wire-sized chunks when it doesn't fit a single
    /// `MeshPacket` payload, sending each as its own packet with its own
    /// `requestId` and outbound record (I4). Returns the first chunk's
    /// request id — the one a caller correlates the send with; later
    /// chunks are tracked in the store but not individually reported
    /// (see DESIGN.md).
    pub async fn send_text(
        &self,
        text: &str,
        channel: i32,
        destination: Option<u32>,
        reply_id: Option<u32>,
        emoji: Option<i32>,
    ) -> Result<u32> {
        let chunks = split_text(text, MAX_TEXT_PAYLOAD_BYTES);
        let mut first_request_id = None;
        for (i, chunk) in chunks.iter().enumerate() {
            // Only the first chunk carries replyId/emoji; they're
            // properties of the logical message, not of each fragment.
            let request_id = self
                .send_text_chunk(chunk, channel, destination, if i == 0 { reply_id } else { None }, if i == 0 { emoji } else { None })
                .await?;
            first_request_id.get_or_insert(request_id);
        }
        Ok(first_request_id.expect("split_text always yields at least one chunk"))
    }

    async fn send_text_chunk(
        &self,
        text: &str,
        channel: i32,
        destination: Option<u32>,
        reply_id: Option<u32>,
        emoji: Option<i32>,
    ) -> Result<u32> {
        let from = self.local_node_num()?;
        let to = destination.unwrap_or(BROADCAST_NUM);
        let is_broadcast = to == BROADCAST_NUM;
        let request_id = next_request_id();

        let data = pb::Data {
            portnum: pb::PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            want_response: false,
            dest: 0,
            source: 0,
            request_id,
            reply_id: reply_id.unwrap_or(0),
            emoji: emoji.unwrap_or(0),
            ..Default::default()
        };
        let wire_channel = if channel < 0 { 0u32 } else { channel as u32 };
        let packet = pb::MeshPacket {
            from,
            to,
            channel: wire_channel,
            payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
            id: request_id,
            hop_limit: 3,
            want_ack: true,
            priority: if is_broadcast { 0 } else { 70 },
            ..Default::default()
        };
        self.send_to_radio(pb::to_radio::PayloadVariant::Packet(packet))
            .await?;

        self.store
            .insert_message(MessageRecord {
                id: Uuid::new_v4().to_string(),
                kind: MessageKind::Text,
                request_id: Some(request_id),
                from_num: from,
                to_num: if is_broadcast { None } else { Some(to) },
                channel,
                text: text.to_string(),
                reply_id,
                emoji,
                hop_start: None,
                hop_limit: Some(3),
                want_ack: true,
                delivery_state: DeliveryState::Pending,
                is_read: false,
                timestamp: chrono::Utc::now(),
            })
            .await?;

        Ok(request_id)
    }

    /// `sendTraceroute` (§4.13): records the request timestamp in the store.
    pub async fn send_traceroute(&self, destination: u32, channel: u32) -> Result<()> {
        let from = self.local_node_num()?;
        let request_id = next_request_id();
        let route_discovery = pb::RouteDiscovery::default();
        let mut payload = Vec::new();
        route_discovery.encode(&mut payload)?;
        let data = pb::Data {
            portnum: pb::PortNum::TracerouteApp as i32,
            payload: Bytes::from(payload),
            want_response: true,
            dest: 0,
            source: 0,
            request_id,
            reply_id: 0,
            emoji: 0,
            ..Default::default()
        };
        let packet = pb::MeshPacket {
            from,
            to: destination,
            channel,
            payload_variant: Some(pb::mesh_packet::PayloadVariant::Decoded(data)),
            id: request_id,
            hop_limit: 7,
            want_ack: true,
            priority: 70,
            ..Default::default()
        };
        self.send_to_radio(pb::to_radio::PayloadVariant::Packet(packet))
            .await?;
        self.store
            .record_traceroute_request(destination, chrono::Utc::now())
            .await?;
        Ok(())
    }

    /// `sendRaw` (§4.13): passthrough used by the virtual-node fan-out
    /// to forward mobile-client frames.
    pub async fn send_raw(&self, bytes: Bytes) -> Result<()> {
        self.transport.send(bytes).await
    }

    /// §4.14: emits the `want_config_id` request that opens the init
    /// capture window. The id is an arbitrary non-zero nonce echoed back
    /// by the device; this manager doesn't correlate it to anything
    /// beyond "a config push is in flight", so any non-zero value works.
    pub async fn send_want_config_id(&self, request_id: u32) -> Result<()> {
        self.send_to_radio(pb::to_radio::PayloadVariant::WantConfigId(request_id))
            .await
    }

    pub async fn add_favorite_node(&self, node_num: u32) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetFavoriteNode(node_num)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn remove_favorite_node(&self, node_num: u32) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::RemoveFavoriteNode(node_num)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn reboot(&self, seconds: i32) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::RebootSeconds(seconds)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn set_owner(&self, user: pb::User) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetOwner(user)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn set_device_config(&self, config: pb::Config) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetConfig(config)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn set_lora_config(&self, lora: pb::config::LoRaConfig) -> Result<()> {
        self.set_device_config(pb::Config {
            payload_variant: Some(pb::config::PayloadVariant::Lora(lora)),
        })
        .await
    }

    pub async fn set_position_config(&self, position: pb::config::PositionConfig) -> Result<()> {
        self.set_device_config(pb::Config {
            payload_variant: Some(pb::config::PayloadVariant::Position(position)),
        })
        .await
    }

    pub async fn set_module_config(&self, config: pb::ModuleConfig) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetModuleConfig(config)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn set_mqtt_config(&self, mqtt: pb::module_config::MqttConfig) -> Result<()> {
        self.set_module_config(pb::ModuleConfig {
            payload_variant: Some(pb::module_config::PayloadVariant::Mqtt(mqtt)),
        })
        .await
    }

    pub async fn set_neighbor_info_config(
        &self,
        neighbor_info: pb::module_config::NeighborInfoConfig,
    ) -> Result<()> {
        self.set_module_config(pb::ModuleConfig {
            payload_variant: Some(pb::module_config::PayloadVariant::NeighborInfo(neighbor_info)),
        })
        .await
    }

    pub async fn set_channel(&self, channel: pb::Channel) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetChannel(channel)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn set_fixed_position(&self, position: pb::Position) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::SetFixedPosition(position)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn begin_edit_settings(&self) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::BeginEditSettings(true)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn commit_edit_settings(&self) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::CommitEditSettings(true)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn get_config(&self, section: i32) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::GetConfigRequest(section)),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    pub async fn get_module_config(&self, section: i32) -> Result<()> {
        let admin = pb::AdminMessage {
            payload_variant: Some(pb::admin_message::PayloadVariant::GetModuleConfigRequest(
                section,
            )),
            ..Default::default()
        };
        let local = self.local_node_num()?;
        self.send_admin(admin, local).await
    }

    /// Waits ≈3s for a device response carrying a session passkey
    /// (§4.7: "sends a get-config and waits briefly for the response").
    /// Reuses [`OutboundSurface::get_config`] rather than building its
    /// own admin frame — the device's config response is what carries
    /// the passkey, the same request `get_config` already sends for its
    /// own callers. The caller (manager dispatch) is responsible for
    /// completing `waiter` when an admin frame with `session_passkey`
    /// arrives.
    pub async fn request_session_passkey(
        &self,
        waiter: tokio::sync::oneshot::Receiver<SessionPasskey>,
    ) -> Result<SessionPasskey> {
        self.get_config(0).await?;

        tokio::time::timeout(SESSION_PASSKEY_WAIT, waiter)
            .await
            .map_err(|_| anyhow!("timed out waiting for session passkey"))?
            .map_err(|_| anyhow!("session passkey channel closed before a response arrived"))
    }
}

/// Delivery tracker (§4.6, §4.13 state machine). ACK/NAK frames are
/// applied through the store's `update_message_delivery_state`;
/// callers look up the outbound record first via
/// `get_message_by_request_id` so the self-vs-target distinction can be
/// made before writing the new state.
pub async fn apply_routing_ack(
    store: &dyn MeshStore,
    local_node_num: u32,
    request_id: u32,
    ack_from: u32,
    error_reason_is_none: bool,
) -> Result<()> {
    let Some(message) = store.get_message_by_request_id(request_id).await? else {
        return Ok(());
    };

    // Terminal states never regress (§4.13 state machine, testable
    // property "no two ACKs advance a single outbound record backwards").
    if matches!(
        message.delivery_state,
        DeliveryState::Confirmed | DeliveryState::Failed
    ) {
        return Ok(());
    }

    if !error_reason_is_none {
        store
            .update_message_delivery_state(request_id, DeliveryState::Failed)
            .await?;
        return Ok(());
    }

    let is_dm = message.channel < 0;
    let target = message.to_num;

    if ack_from == local_node_num {
        if message.delivery_state == DeliveryState::Pending {
            store
                .update_message_delivery_state(request_id, DeliveryState::Delivered)
                .await?;
        }
        return Ok(());
    }

    if is_dm && target == Some(ack_from) {
        store
            .update_message_delivery_state(request_id, DeliveryState::Confirmed)
            .await?;
    }
    // Any other ACK source is a non-target intermediate: ignored (§4.6).
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonStore, MessageRecord};

    async fn store_with_pending_dm(request_id: u32, from: u32, to: u32) -> Arc<dyn MeshStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("data")).await.unwrap();
        store
            .insert_message(MessageRecord {
                id: "1".to_string(),
                kind: MessageKind::Text,
                request_id: Some(request_id),
                from_num: from,
                to_num: Some(to),
                channel: -1,
                text: "hi".to_string(),
                reply_id: None,
                emoji: None,
                hop_start: None,
                hop_limit: None,
                want_ack: true,
                delivery_state: DeliveryState::Pending,
                is_read: false,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn ack_from_self_then_target_advances_to_confirmed() {
        let store = store_with_pending_dm(42, 1, 0x1122_3344).await;

        apply_routing_ack(store.as_ref(), 1, 42, 1, true).await.unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Delivered);

        apply_routing_ack(store.as_ref(), 1, 42, 0x1122_3344, true)
            .await
            .unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Confirmed);
    }

    #[tokio::test]
    async fn later_nak_does_not_regress_confirmed_state() {
        let store = store_with_pending_dm(42, 1, 0x1122_3344).await;
        apply_routing_ack(store.as_ref(), 1, 42, 1, true).await.unwrap();
        apply_routing_ack(store.as_ref(), 1, 42, 0x1122_3344, true)
            .await
            .unwrap();

        apply_routing_ack(store.as_ref(), 1, 42, 0x1122_3344, false)
            .await
            .unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Confirmed);
    }

    #[test]
    fn short_text_is_not_split() {
        assert_eq!(split_text("hello mesh", 200), vec!["hello mesh".to_string()]);
    }

    #[test]
    fn long_text_splits_on_word_boundaries_under_the_limit() {
        let word = "abcdefghij"; // 10 bytes
        let text = std::iter::repeat(word).take(30).collect::<Vec<_>>().join(" ");
        let chunks = split_text(&text, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 40, "chunk {:?} exceeds limit", chunk);
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn a_single_word_longer_than_the_limit_is_hard_split() {
        let word = "x".repeat(55);
        let chunks = split_text(&word, 20);
        assert!(chunks.iter().all(|c| c.len() <= 20));
        assert_eq!(chunks.concat(), word);
    }

    #[tokio::test]
    async fn ack_from_non_target_intermediate_is_ignored() {
        let store = store_with_pending_dm(42, 1, 0x1122_3344).await;
        apply_routing_ack(store.as_ref(), 1, 42, 0x9999, true).await.unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Pending);
    }
}
