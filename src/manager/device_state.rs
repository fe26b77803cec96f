//! Device-state model (§4.2, §3 `LocalNode`/`DeviceConfig`/`ModuleConfig`).
//!
//! Generalizes the template's ad-hoc `MeshtasticDevice` fields
//! (`have_my_info`, `have_radio_config`, `nodes: HashMap<u32, NodeInfo>`,
//! `our_node_id`) into one owned value with an explicit API, per the
//! redesign note against implicit globals colocated on one large
//! object (§9): no module-level state, just fields on [`DeviceState`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::protobuf::meshtastic_generated as pb;

/// The single radio this process is connected to (§3 `LocalNode`).
#[derive(Debug, Clone, Default)]
pub struct LocalNode {
    pub num: u32,
    pub node_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hardware_model: Option<i32>,
    pub firmware_version: Option<String>,
    pub reboot_count: u32,
    pub is_locked: bool,
}

impl LocalNode {
    fn from_my_node_info(num: u32) -> Self {
        LocalNode {
            num,
            node_id: format!("!{:08x}", num),
            long_name: None,
            short_name: None,
            hardware_model: None,
            firmware_version: None,
            reboot_count: 0,
            is_locked: false,
        }
    }
}

/// Tag for one of the eight `Config` sub-messages (§9: "two tagged
/// unions... plus a map keyed by variant tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceConfigKey {
    Device,
    Position,
    Power,
    Network,
    Display,
    Lora,
    Bluetooth,
    Security,
}

/// Tag for one of the thirteen `ModuleConfig` sub-messages (§4.14: "all
/// 13 module types").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleConfigKey {
    Mqtt,
    Serial,
    ExternalNotification,
    StoreForward,
    RangeTest,
    Telemetry,
    CannedMessage,
    Audio,
    RemoteHardware,
    NeighborInfo,
    AmbientLighting,
    DetectionSensor,
    Paxcounter,
}

fn device_config_key(variant: &pb::config::PayloadVariant) -> DeviceConfigKey {
    use pb::config::PayloadVariant as V;
    match variant {
        V::Device(_) => DeviceConfigKey::Device,
        V::Position(_) => DeviceConfigKey::Position,
        V::Power(_) => DeviceConfigKey::Power,
        V::Network(_) => DeviceConfigKey::Network,
        V::Display(_) => DeviceConfigKey::Display,
        V::Lora(_) => DeviceConfigKey::Lora,
        V::Bluetooth(_) => DeviceConfigKey::Bluetooth,
        V::Security(_) => DeviceConfigKey::Security,
    }
}

fn module_config_key(variant: &pb::module_config::PayloadVariant) -> ModuleConfigKey {
    use pb::module_config::PayloadVariant as V;
    match variant {
        V::Mqtt(_) => ModuleConfigKey::Mqtt,
        V::Serial(_) => ModuleConfigKey::Serial,
        V::ExternalNotification(_) => ModuleConfigKey::ExternalNotification,
        V::StoreForward(_) => ModuleConfigKey::StoreForward,
        V::RangeTest(_) => ModuleConfigKey::RangeTest,
        V::Telemetry(_) => ModuleConfigKey::Telemetry,
        V::CannedMessage(_) => ModuleConfigKey::CannedMessage,
        V::Audio(_) => ModuleConfigKey::Audio,
        V::RemoteHardware(_) => ModuleConfigKey::RemoteHardware,
        V::NeighborInfo(_) => ModuleConfigKey::NeighborInfo,
        V::AmbientLighting(_) => ModuleConfigKey::AmbientLighting,
        V::DetectionSensor(_) => ModuleConfigKey::DetectionSensor,
        V::Paxcounter(_) => ModuleConfigKey::Paxcounter,
    }
}

/// Merged bag of device config sub-messages. Merge is shallow key-wise:
/// a later update for a key fully replaces the prior value for that
/// key, but never clears a key it doesn't mention (I2/§9 open question:
/// specified here as intentional "sticky config").
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    sub_configs: HashMap<DeviceConfigKey, pb::config::PayloadVariant>,
}

impl DeviceConfig {
    pub fn merge(&mut self, config: pb::Config) {
        if let Some(variant) = config.payload_variant {
            self.sub_configs.insert(device_config_key(&variant), variant);
        }
    }

    pub fn get(&self, key: DeviceConfigKey) -> Option<&pb::config::PayloadVariant> {
        self.sub_configs.get(&key)
    }
}

/// Merged bag of module config sub-messages, same merge rule.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    sub_configs: HashMap<ModuleConfigKey, pb::module_config::PayloadVariant>,
}

impl ModuleConfig {
    pub fn merge(&mut self, config: pb::ModuleConfig) {
        if let Some(variant) = config.payload_variant {
            self.sub_configs.insert(module_config_key(&variant), variant);
        }
    }

    pub fn get(&self, key: ModuleConfigKey) -> Option<&pb::module_config::PayloadVariant> {
        self.sub_configs.get(&key)
    }
}

/// Tri-state favorites-support cache (§3, §4.15). Invalidated on
/// disconnect and on firmware-version change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FavoritesSupport {
    Unknown,
    Yes,
    No,
}

/// Owns the local node, the two config bags, and the favorites cache.
/// No external component may mutate these directly (§5 "Shared state
/// policy") — everything goes through the methods below.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    local: Option<LocalNode>,
    device_config: DeviceConfig,
    module_config: ModuleConfig,
    favorites_support: FavoritesSupportCacheState,
}

#[derive(Debug, Clone, Copy, Default)]
struct FavoritesSupportCacheState {
    state: Option<FavoritesSupport>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_local(&self) -> Option<&LocalNode> {
        self.local.as_ref()
    }

    pub fn get_device_config(&self) -> &DeviceConfig {
        &self.device_config
    }

    pub fn get_module_config(&self) -> &ModuleConfig {
        &self.module_config
    }

    /// Seeds the local node from the first `MyNodeInfo` (§4.2). If
    /// `stored_long_name` is `Some` (an existing store row had a
    /// non-default long name), the state is locked immediately.
    pub fn process_my_node_info(&mut self, my_node_num: u32, stored_long_name: Option<String>) {
        let mut node = LocalNode::from_my_node_info(my_node_num);
        if let Some(long_name) = stored_long_name {
            node.long_name = Some(long_name);
            node.is_locked = true;
        }
        self.local = Some(node);
    }

    /// Only updates firmware version (allowed even when locked) and
    /// invalidates the favorites cache (§4.2).
    pub fn process_device_metadata(&mut self, firmware_version: String) {
        if let Some(node) = self.local.as_mut() {
            node.firmware_version = Some(firmware_version);
        }
        self.invalidate_favorites_cache();
    }

    /// Updates the reboot counter from `MyNodeInfo` (I3: "firmware
    /// version and reboot count remain mutable" even once `isLocked`).
    pub fn process_reboot_count(&mut self, reboot_count: u32) {
        if let Some(node) = self.local.as_mut() {
            node.reboot_count = reboot_count;
        }
    }

    /// Fills names from a matching `NodeInfo` for the local node if not
    /// yet locked, then locks (I3, §4.3.1).
    pub fn adopt_local_names(&mut self, long_name: String, short_name: String) {
        if let Some(node) = self.local.as_mut() {
            if !node.is_locked {
                node.long_name = Some(long_name);
                node.short_name = Some(short_name);
                node.is_locked = true;
            }
        }
    }

    pub fn is_local_node(&self, num: u32) -> bool {
        self.local.as_ref().map(|n| n.num) == Some(num)
    }

    pub fn merge_device_config(&mut self, config: pb::Config) {
        self.device_config.merge(config);
    }

    pub fn merge_module_config(&mut self, config: pb::ModuleConfig) {
        self.module_config.merge(config);
    }

    pub fn invalidate_favorites_cache(&mut self) {
        self.favorites_support.state = None;
    }

    /// `supportsFavorites()` (§4.15): `(major>2) ∨ (major=2 ∧ minor≥7)`.
    /// Cached after the first computation; recomputed whenever the
    /// cache was invalidated.
    pub fn supports_favorites(&mut self) -> bool {
        if let Some(state) = self.favorites_support.state {
            return state == FavoritesSupport::Yes;
        }
        let version = self.local.as_ref().and_then(|n| n.firmware_version.clone());
        let supported = match version.as_deref().and_then(parse_firmware_version) {
            Some((major, minor, _patch)) => major > 2 || (major == 2 && minor >= 7),
            None => false,
        };
        self.favorites_support.state = Some(if supported {
            FavoritesSupport::Yes
        } else {
            FavoritesSupport::No
        });
        supported
    }
}

/// Parses `"<major>.<minor>.<patch>[.<suffix>]"` (§4.2).
pub fn parse_firmware_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    let patch: u32 = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

/// Caps a wire timestamp at "now" so `lastHeard` never moves into the
/// future (§4.3.1, testable property in §8).
pub fn clamp_last_heard(candidate: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if candidate > now {
        now
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_firmware_version() {
        assert_eq!(parse_firmware_version("2.7.1"), Some((2, 7, 1)));
        assert_eq!(parse_firmware_version("2.7.1.abcd"), Some((2, 7, 1)));
    }

    #[test]
    fn rejects_malformed_firmware_version() {
        assert_eq!(parse_firmware_version("garbage"), None);
        assert_eq!(parse_firmware_version("2.7"), None);
    }

    #[test]
    fn favorites_supported_from_2_7_0_inclusive() {
        let mut state = DeviceState::new();
        state.process_my_node_info(1, None);
        state.process_device_metadata("2.6.9".to_string());
        assert!(!state.supports_favorites());
        state.process_device_metadata("2.7.0".to_string());
        assert!(state.supports_favorites());
        state.process_device_metadata("3.0.0".to_string());
        assert!(state.supports_favorites());
    }

    #[test]
    fn locked_local_node_keeps_names_but_allows_firmware_update() {
        let mut state = DeviceState::new();
        state.process_my_node_info(7, Some("Existing Name".to_string()));
        assert!(state.get_local().unwrap().is_locked);

        state.adopt_local_names("New Name".to_string(), "NN".to_string());
        assert_eq!(
            state.get_local().unwrap().long_name.as_deref(),
            Some("Existing Name")
        );

        state.process_device_metadata("2.7.2".to_string());
        assert_eq!(
            state.get_local().unwrap().firmware_version.as_deref(),
            Some("2.7.2")
        );

        state.process_reboot_count(3);
        assert_eq!(state.get_local().unwrap().reboot_count, 3);
        assert_eq!(
            state.get_local().unwrap().long_name.as_deref(),
            Some("Existing Name")
        );
    }

    #[test]
    fn clamps_future_timestamps_to_now() {
        let future = Utc::now() + chrono::Duration::days(1);
        let clamped = clamp_last_heard(future);
        assert!(clamped <= Utc::now());
    }
}
