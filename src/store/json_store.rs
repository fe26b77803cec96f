//! File-based [`MeshStore`] implementation.
//!
//! Grounded in the template's `storage::Storage`: one JSON file per
//! entity under a configured data directory, synchronous
//! `std::fs`-plus-`fs2` exclusive locking for each write (`fs2` has no
//! async API, so writes hop onto `spawn_blocking` the same way the
//! template does them inline on its own blocking helper), `tokio::fs`
//! for reads. A single in-process `tokio::sync::Mutex` serializes
//! logical read-modify-write sequences — file locking alone only
//! protects against other processes, not two tasks racing inside this
//! one.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    ChannelRecord, DeliveryState, MeshStore, MessageRecord, NeighborInfoRecord, NodeRecord,
    NodeUpsert, PacketLogEntry, RouteSegment, TelemetryKind, TelemetryRecord, TracerouteRecord,
};

pub struct JsonStore {
    data_dir: PathBuf,
    guard: Mutex<()>,
}

impl JsonStore {
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        Ok(JsonStore {
            data_dir,
            guard: Mutex::new(()),
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T> {
        let path = self.path(file);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| anyhow!("corrupt {}: {}", file, e))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(anyhow!("failed reading {}: {}", file, e)),
        }
    }

    /// Write content to a file with an exclusive lock, same helper shape
    /// as the template's `write_file_locked`.
    async fn write_json<T: Serialize + Send + 'static>(&self, file: &str, value: T) -> Result<()> {
        let path = self.path(file);
        let content = serde_json::to_string_pretty(&value)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            use fs2::FileExt;
            use std::fs::OpenOptions;
            use std::io::Write;

            let mut handle = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            handle.lock_exclusive()?;
            handle.write_all(content.as_bytes())?;
            handle.flush()?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

fn segment_key(node_a: u32, node_b: u32) -> String {
    if node_a <= node_b {
        format!("{node_a}-{node_b}")
    } else {
        format!("{node_b}-{node_a}")
    }
}

type NodeTable = HashMap<u32, NodeRecord>;
type MessageTable = HashMap<String, MessageRecord>;
type ChannelTable = HashMap<u8, ChannelRecord>;
type TelemetryTable = Vec<TelemetryRecord>;
type TracerouteTable = Vec<TracerouteRecord>;
type SegmentTable = HashMap<String, RouteSegment>;
type NeighborTable = Vec<NeighborInfoRecord>;
type SettingsTable = HashMap<String, String>;
type PacketLogTable = Vec<PacketLogEntry>;
type ProbeHistoryTable = HashMap<u32, DateTime<Utc>>;

#[async_trait]
impl MeshStore for JsonStore {
    async fn upsert_node(&self, update: NodeUpsert) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut nodes: NodeTable = self.read_json("nodes.json").await?;
        let entry = nodes.entry(update.num).or_insert_with(|| NodeRecord {
            num: update.num,
            node_id: update
                .node_id
                .clone()
                .unwrap_or_else(|| format!("!{:08x}", update.num)),
            long_name: None,
            short_name: None,
            hardware_model: None,
            firmware_version: None,
            is_locked: false,
            is_favorite: false,
            public_key_base64: None,
            is_known_low_entropy_key: false,
            pki_encrypted: false,
            last_heard: update.last_heard.unwrap_or_else(Utc::now),
            snr: None,
            rssi: None,
            hops_away: None,
            position: None,
            is_mobile: false,
            welcomed_at: None,
        });

        if let Some(v) = update.node_id {
            entry.node_id = v;
        }
        if let Some(v) = update.long_name {
            entry.long_name = Some(v);
        }
        if let Some(v) = update.short_name {
            entry.short_name = Some(v);
        }
        if let Some(v) = update.hardware_model {
            entry.hardware_model = Some(v);
        }
        if let Some(v) = update.firmware_version {
            entry.firmware_version = Some(v);
        }
        if let Some(v) = update.is_locked {
            entry.is_locked = v;
        }
        if let Some(v) = update.is_favorite {
            entry.is_favorite = v;
        }
        if let Some(v) = update.public_key_base64 {
            entry.public_key_base64 = Some(v);
        }
        if let Some(v) = update.is_known_low_entropy_key {
            entry.is_known_low_entropy_key = v;
        }
        if let Some(v) = update.pki_encrypted {
            entry.pki_encrypted = v;
        }
        if let Some(v) = update.last_heard {
            entry.last_heard = v;
        }
        if let Some(v) = update.snr {
            entry.snr = Some(v);
        }
        if let Some(v) = update.rssi {
            entry.rssi = Some(v);
        }
        if let Some(v) = update.hops_away {
            entry.hops_away = Some(v);
        }
        if let Some(v) = update.position {
            entry.position = Some(v);
        }
        if let Some(v) = update.is_mobile {
            entry.is_mobile = v;
        }
        if let Some(v) = update.welcomed_at {
            entry.welcomed_at = Some(v);
        }

        self.write_json("nodes.json", nodes).await
    }

    async fn get_node(&self, num: u32) -> Result<Option<NodeRecord>> {
        let nodes: NodeTable = self.read_json("nodes.json").await?;
        Ok(nodes.get(&num).cloned())
    }

    async fn insert_message(&self, message: MessageRecord) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut messages: MessageTable = self.read_json("messages.json").await?;
        messages.insert(message.id.clone(), message);
        self.write_json("messages.json", messages).await
    }

    async fn get_message_by_request_id(&self, request_id: u32) -> Result<Option<MessageRecord>> {
        let messages: MessageTable = self.read_json("messages.json").await?;
        Ok(messages
            .values()
            .find(|m| m.request_id == Some(request_id))
            .cloned())
    }

    async fn update_message_delivery_state(
        &self,
        request_id: u32,
        state: DeliveryState,
    ) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut messages: MessageTable = self.read_json("messages.json").await?;
        let found = messages
            .values_mut()
            .find(|m| m.request_id == Some(request_id));
        match found {
            Some(message) => {
                message.delivery_state = state;
                self.write_json("messages.json", messages).await
            }
            None => Err(anyhow!("no message with request_id {}", request_id)),
        }
    }

    async fn mark_message_as_read(&self, id: &str) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut messages: MessageTable = self.read_json("messages.json").await?;
        match messages.get_mut(id) {
            Some(message) => {
                message.is_read = true;
                self.write_json("messages.json", messages).await
            }
            None => Err(anyhow!("no message with id {}", id)),
        }
    }

    async fn upsert_channel(&self, channel: ChannelRecord) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut channels: ChannelTable = self.read_json("channels.json").await?;
        channels.insert(channel.index, channel);
        self.write_json("channels.json", channels).await
    }

    async fn get_channel_by_id(&self, index: u8) -> Result<Option<ChannelRecord>> {
        let channels: ChannelTable = self.read_json("channels.json").await?;
        Ok(channels.get(&index).cloned())
    }

    async fn insert_telemetry(&self, row: TelemetryRecord) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut rows: TelemetryTable = self.read_json("telemetry.json").await?;
        rows.push(row);
        self.write_json("telemetry.json", rows).await
    }

    async fn get_latest_telemetry_for_type(
        &self,
        node_num: u32,
        kind: TelemetryKind,
    ) -> Result<Option<TelemetryRecord>> {
        let rows: TelemetryTable = self.read_json("telemetry.json").await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.node_num == node_num && r.kind == kind)
            .max_by_key(|r| r.timestamp))
    }

    async fn insert_traceroute(&self, record: TracerouteRecord) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut records: TracerouteTable = self.read_json("traceroutes.json").await?;
        records.push(record);
        self.write_json("traceroutes.json", records).await
    }

    async fn insert_route_segment(&self, segment: RouteSegment) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut segments: SegmentTable = self.read_json("route_segments.json").await?;
        segments.insert(segment_key(segment.node_a, segment.node_b), segment);
        self.write_json("route_segments.json", segments).await
    }

    async fn update_record_holder_segment(&self, node_a: u32, node_b: u32) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut segments: SegmentTable = self.read_json("route_segments.json").await?;
        let key = segment_key(node_a, node_b);
        for (k, segment) in segments.iter_mut() {
            segment.is_record_holder = *k == key;
        }
        self.write_json("route_segments.json", segments).await
    }

    async fn record_traceroute_request(&self, target_num: u32, at: DateTime<Utc>) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut history: ProbeHistoryTable = self.read_json("traceroute_requests.json").await?;
        history.insert(target_num, at);
        self.write_json("traceroute_requests.json", history).await
    }

    async fn get_node_needing_traceroute(&self) -> Result<Option<u32>> {
        let nodes: NodeTable = self.read_json("nodes.json").await?;
        let history: ProbeHistoryTable = self.read_json("traceroute_requests.json").await?;

        let mut unprobed: Vec<u32> = nodes
            .keys()
            .copied()
            .filter(|num| !history.contains_key(num))
            .collect();
        unprobed.sort_unstable();
        if let Some(first) = unprobed.into_iter().next() {
            return Ok(Some(first));
        }

        Ok(history
            .iter()
            .filter(|(num, _)| nodes.contains_key(num))
            .min_by_key(|(_, ts)| **ts)
            .map(|(num, _)| *num))
    }

    async fn save_neighbor_info(&self, row: NeighborInfoRecord) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut rows: NeighborTable = self.read_json("neighbors.json").await?;
        rows.push(row);
        self.write_json("neighbors.json", rows).await
    }

    async fn update_node_mobility(&self, num: u32, is_mobile: bool) -> Result<()> {
        self.upsert_node(NodeUpsert {
            is_mobile: Some(is_mobile),
            ..NodeUpsert::new(num)
        })
        .await
    }

    async fn get_active_nodes(&self, max_age_hours: u32) -> Result<Vec<NodeRecord>> {
        let nodes: NodeTable = self.read_json("nodes.json").await?;
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours as i64);
        Ok(nodes
            .into_values()
            .filter(|n| n.last_heard >= cutoff)
            .collect())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let settings: SettingsTable = self.read_json("settings.json").await?;
        Ok(settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut settings: SettingsTable = self.read_json("settings.json").await?;
        settings.insert(key.to_string(), value.to_string());
        self.write_json("settings.json", settings).await
    }

    async fn log_packet(&self, entry: PacketLogEntry) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut log: PacketLogTable = self.read_json("packet_log.json").await?;
        log.push(entry);
        self.write_json("packet_log.json", log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChannelRole, MessageKind};

    async fn store() -> JsonStore {
        let dir = tempfile::tempdir().unwrap();
        JsonStore::new(dir.path().join("data")).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_node_merges_shallow_never_clearing_absent_fields() {
        let store = store().await;
        store
            .upsert_node(NodeUpsert {
                long_name: Some("Alice Node".to_string()),
                ..NodeUpsert::new(42)
            })
            .await
            .unwrap();
        store
            .upsert_node(NodeUpsert {
                short_name: Some("AL".to_string()),
                ..NodeUpsert::new(42)
            })
            .await
            .unwrap();

        let node = store.get_node(42).await.unwrap().unwrap();
        assert_eq!(node.long_name.as_deref(), Some("Alice Node"));
        assert_eq!(node.short_name.as_deref(), Some("AL"));
    }

    #[tokio::test]
    async fn message_round_trip_and_delivery_state_transitions() {
        let store = store().await;
        store
            .insert_message(MessageRecord {
                id: "1_42".to_string(),
                kind: MessageKind::Text,
                request_id: Some(42),
                from_num: 1,
                to_num: Some(0x1122_3344),
                channel: -1,
                text: "hi".to_string(),
                reply_id: None,
                emoji: None,
                hop_start: None,
                hop_limit: None,
                want_ack: true,
                delivery_state: DeliveryState::Pending,
                is_read: false,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        store
            .update_message_delivery_state(42, DeliveryState::Delivered)
            .await
            .unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Delivered);

        store
            .update_message_delivery_state(42, DeliveryState::Confirmed)
            .await
            .unwrap();
        let message = store.get_message_by_request_id(42).await.unwrap().unwrap();
        assert_eq!(message.delivery_state, DeliveryState::Confirmed);
    }

    #[tokio::test]
    async fn channel_zero_is_primary_after_upsert() {
        let store = store().await;
        store
            .upsert_channel(ChannelRecord {
                index: 0,
                name: None,
                psk_base64: None,
                role: ChannelRole::Primary,
                position_precision: None,
            })
            .await
            .unwrap();
        let channel = store.get_channel_by_id(0).await.unwrap().unwrap();
        assert_eq!(channel.role, ChannelRole::Primary);
    }

    #[tokio::test]
    async fn node_needing_traceroute_prefers_unprobed_then_oldest() {
        let store = store().await;
        store.upsert_node(NodeUpsert::new(1)).await.unwrap();
        store.upsert_node(NodeUpsert::new(2)).await.unwrap();

        let picked = store.get_node_needing_traceroute().await.unwrap();
        assert_eq!(picked, Some(1));

        store
            .record_traceroute_request(1, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();
        let picked = store.get_node_needing_traceroute().await.unwrap();
        assert_eq!(picked, Some(2));

        store
            .record_traceroute_request(2, Utc::now())
            .await
            .unwrap();
        let picked = store.get_node_needing_traceroute().await.unwrap();
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = store().await;
        assert_eq!(store.get_setting("autoAckEnabled").await.unwrap(), None);
        store
            .set_setting("autoAckEnabled", "true")
            .await
            .unwrap();
        assert_eq!(
            store.get_setting("autoAckEnabled").await.unwrap(),
            Some("true".to_string())
        );
    }
}
