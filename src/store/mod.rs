//! # Persistent store contract
//!
//! The historical database is an external collaborator (spec §1): the
//! manager never owns it, it only calls the narrow set of named
//! operations in [`MeshStore`]. [`json_store::JsonStore`] is the one
//! concrete implementation shipped with this crate, grounded in the
//! template's `storage::Storage` — one JSON file per entity under a
//! data directory, `fs2` exclusive-lock writes. Anything implementing
//! `MeshStore` can be swapped in without touching the manager.

pub mod json_store;

pub use json_store::JsonStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbound delivery state machine (§4.13). Ordering is enforced by the
/// delivery tracker, not by this type — the store just records whatever
/// state it is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Confirmed,
    Failed,
}

/// Routing error-reason enumeration (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    None,
    NoRoute,
    GotNak,
    Timeout,
    NoInterface,
    MaxRetransmit,
    NoChannel,
    TooLarge,
    NoResponse,
    DutyCycleLimit,
    BadRequest,
    NotAuthorized,
}

/// Channel role (§4.3.2): index 0 is always `Primary`, 1-7 never are (I5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

/// Last-known position snapshot carried on a [`NodeRecord`] (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    pub precision_bits: u32,
    pub updated_at: DateTime<Utc>,
}

/// A node row (§3 `LocalNode` generalizes to every node seen on the mesh,
/// not just the local one — the manager additionally keeps a dedicated
/// in-memory `LocalNode` for its own radio, see [`crate::manager::device_state`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_base64: Option<String>,
    #[serde(default)]
    pub is_known_low_entropy_key: bool,
    #[serde(default)]
    pub pki_encrypted: bool,
    pub last_heard: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops_away: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionSnapshot>,
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcomed_at: Option<DateTime<Utc>>,
}

/// Partial update passed to [`MeshStore::upsert_node`]. `num`/`node_id`
/// identify the row; every other field is `Some` to set, `None` to leave
/// whatever is already stored untouched — mirrors the device-config
/// "shallow merge, never overwrite with absent" rule (I2) at the store
/// layer for node fields.
#[derive(Debug, Clone, Default)]
pub struct NodeUpsert {
    pub num: u32,
    pub node_id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hardware_model: Option<String>,
    pub firmware_version: Option<String>,
    pub is_locked: Option<bool>,
    pub is_favorite: Option<bool>,
    pub public_key_base64: Option<String>,
    pub is_known_low_entropy_key: Option<bool>,
    pub pki_encrypted: Option<bool>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub position: Option<PositionSnapshot>,
    pub is_mobile: Option<bool>,
    pub welcomed_at: Option<DateTime<Utc>>,
}

impl NodeUpsert {
    pub fn new(num: u32) -> Self {
        NodeUpsert {
            num,
            ..Default::default()
        }
    }
}

/// Message kind: a plain text message or a rendered traceroute summary
/// persisted as a message row (§4.9 "Persist the rendered text as a
/// traceroute-typed message").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Traceroute,
}

/// A message row (§3 `OutboundMessage record`; also used for inbound
/// text, keyed `"{fromNum}_{packetId}"` per §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    pub from_num: u32,
    /// `None` means the broadcast sentinel (`0xFFFFFFFF`).
    pub to_num: Option<u32>,
    /// `-1` for DM, 0-7 for a channel broadcast (I4/§3).
    pub channel: i32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u32>,
    pub want_ack: bool,
    pub delivery_state: DeliveryState,
    #[serde(default)]
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// A channel row (§4.3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk_base64: Option<String>,
    pub role: ChannelRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_precision: Option<u32>,
}

/// Telemetry kind: every typed row named across §4.3.1/4.5/4.8/4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Latitude,
    Longitude,
    Altitude,
    EstimatedLatitude,
    EstimatedLongitude,
    BatteryLevel,
    Voltage,
    ChannelUtilization,
    AirUtilTx,
    Temperature,
    Humidity,
    Pressure,
    ChannelVoltage(u8),
    ChannelCurrent(u8),
    Snr,
    Rssi,
}

/// A telemetry row (§4.8 and friends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub node_num: u32,
    pub kind: TelemetryKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A traceroute record (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteRecord {
    pub responder_num: u32,
    pub requester_num: u32,
    pub route: Vec<u32>,
    pub route_back: Vec<u32>,
    pub snr_towards: Vec<i32>,
    pub snr_back: Vec<i32>,
    pub timestamp: DateTime<Utc>,
}

/// A route-segment row between two adjacent nodes on an observed path (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSegment {
    pub node_a: u32,
    pub node_b: u32,
    pub distance_km: f64,
    #[serde(default)]
    pub is_record_holder: bool,
    pub updated_at: DateTime<Utc>,
}

/// A neighbor-relation row (§4.3.3 port 71).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborInfoRecord {
    pub node_num: u32,
    pub neighbor_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// One packet-log row (§4.3.3 "Every packet is logged to the packet-log
/// store (when enabled) with a payload preview").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketLogEntry {
    pub from_num: u32,
    pub to_num: Option<u32>,
    pub port: u32,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

/// The narrow, named store interface the core calls (spec §6). Every
/// method here corresponds 1:1 to an operation named in that section;
/// none of them are allowed to grow beyond what's named there.
#[async_trait]
pub trait MeshStore: Send + Sync {
    async fn upsert_node(&self, update: NodeUpsert) -> Result<()>;
    async fn get_node(&self, num: u32) -> Result<Option<NodeRecord>>;

    async fn insert_message(&self, message: MessageRecord) -> Result<()>;
    async fn get_message_by_request_id(&self, request_id: u32) -> Result<Option<MessageRecord>>;
    async fn update_message_delivery_state(
        &self,
        request_id: u32,
        state: DeliveryState,
    ) -> Result<()>;
    async fn mark_message_as_read(&self, id: &str) -> Result<()>;

    async fn upsert_channel(&self, channel: ChannelRecord) -> Result<()>;
    async fn get_channel_by_id(&self, index: u8) -> Result<Option<ChannelRecord>>;

    async fn insert_telemetry(&self, row: TelemetryRecord) -> Result<()>;
    async fn get_latest_telemetry_for_type(
        &self,
        node_num: u32,
        kind: TelemetryKind,
    ) -> Result<Option<TelemetryRecord>>;

    async fn insert_traceroute(&self, record: TracerouteRecord) -> Result<()>;
    async fn insert_route_segment(&self, segment: RouteSegment) -> Result<()>;
    async fn update_record_holder_segment(&self, node_a: u32, node_b: u32) -> Result<()>;
    async fn record_traceroute_request(&self, target_num: u32, at: DateTime<Utc>) -> Result<()>;
    /// Unprobed nodes first, then least-recently-probed (§4.11).
    async fn get_node_needing_traceroute(&self) -> Result<Option<u32>>;

    async fn save_neighbor_info(&self, row: NeighborInfoRecord) -> Result<()>;
    async fn update_node_mobility(&self, num: u32, is_mobile: bool) -> Result<()>;

    async fn get_active_nodes(&self, max_age_hours: u32) -> Result<Vec<NodeRecord>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    async fn log_packet(&self, entry: PacketLogEntry) -> Result<()>;
}
