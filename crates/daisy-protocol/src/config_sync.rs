//! Per-block configuration table kept in sync with the device
//!
//! The host keeps its own copy of every configuration item. Writes go out as
//! config-set packets; the block answers with update and set messages that
//! overwrite the local copy. Only a device update marks an item active.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use daisy_core::{default_config, ConfigId, ConfigItem};

use crate::builder::{HostMessage, HostPacketBuilder};
use crate::transport::DeviceConnection;

pub struct BlockConfigManager {
    items: BTreeMap<ConfigId, ConfigItem>,
    device_index: u8,
    connection: Option<Arc<dyn DeviceConnection>>,
}

impl BlockConfigManager {
    /// Seed the default table, then replace entries with `overrides` by id
    pub fn new(overrides: impl IntoIterator<Item = ConfigItem>) -> Self {
        let mut items: BTreeMap<ConfigId, ConfigItem> =
            default_config().into_iter().map(|item| (item.id, item)).collect();

        for item in overrides {
            items.insert(item.id, item);
        }

        Self {
            items,
            device_index: 0,
            connection: None,
        }
    }

    /// Topology index that outgoing packets are addressed to
    pub fn set_device_index(&mut self, index: u8) {
        self.device_index = index;
    }

    pub fn set_connection(&mut self, connection: Option<Arc<dyn DeviceConnection>>) {
        self.connection = connection;
    }

    pub fn items(&self) -> impl Iterator<Item = &ConfigItem> {
        self.items.values()
    }

    pub fn item_value(&self, id: ConfigId) -> i32 {
        self.items.get(&id).map_or(0, |i| i.value)
    }

    /// Update the local value if known and always send it to the block
    pub fn set_item_value(&mut self, id: ConfigId, value: i32) -> bool {
        if let Some(item) = self.items.get_mut(&id) {
            item.value = value;
        }
        self.send(HostMessage::ConfigSet { item: id.0, value })
    }

    pub fn item_min(&self, id: ConfigId) -> i32 {
        self.items.get(&id).map_or(0, |i| i.min)
    }

    pub fn set_item_min(&mut self, id: ConfigId, min: i32) {
        if let Some(item) = self.items.get_mut(&id) {
            item.min = min;
        }
    }

    pub fn item_max(&self, id: ConfigId) -> i32 {
        self.items.get(&id).map_or(0, |i| i.max)
    }

    pub fn set_item_max(&mut self, id: ConfigId, max: i32) {
        if let Some(item) = self.items.get_mut(&id) {
            item.max = max;
        }
    }

    pub fn item_active(&self, id: ConfigId) -> bool {
        self.items.get(&id).is_some_and(|i| i.active)
    }

    pub fn set_item_active(&mut self, id: ConfigId, active: bool) {
        if let Some(item) = self.items.get_mut(&id) {
            item.active = active;
        }
    }

    pub fn option_name(&self, id: ConfigId, option: usize) -> Option<&str> {
        self.items.get(&id).and_then(|i| i.option_name(option))
    }

    /// Full description of an item, or a bare entry for unknown ids
    pub fn metadata(&self, id: ConfigId) -> ConfigItem {
        self.items
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ConfigItem::bare(id))
    }

    pub fn reset_active_status(&mut self) {
        for item in self.items.values_mut() {
            item.active = false;
        }
    }

    pub fn is_user_config_id(id: ConfigId) -> bool {
        id.is_user()
    }

    pub fn request_item(&self, id: ConfigId) -> bool {
        self.send(HostMessage::ConfigRequest { item: id.0 })
    }

    pub fn request_factory_sync(&self) -> bool {
        self.send(HostMessage::FactorySyncRequest)
    }

    pub fn request_user_sync(&self) -> bool {
        self.send(HostMessage::UserSyncRequest)
    }

    /// The block reported the authoritative state of an item
    pub fn handle_config_update(&mut self, id: ConfigId, value: i32, min: i32, max: i32) {
        let item = self.items.entry(id).or_insert_with(|| {
            debug!(item = %id, "Config update for unknown item");
            ConfigItem::bare(id)
        });
        item.value = value;
        item.min = min;
        item.max = max;
        item.active = true;
    }

    /// The block echoed a value change
    pub fn handle_config_set(&mut self, id: ConfigId, value: i32) {
        self.items
            .entry(id)
            .or_insert_with(|| ConfigItem::bare(id))
            .value = value;
    }

    fn send(&self, message: HostMessage) -> bool {
        let Some(connection) = &self.connection else {
            trace!(?message, "No connection, config message not sent");
            return false;
        };

        let mut packet = HostPacketBuilder::new(self.device_index);
        if let Err(e) = packet.add(&message) {
            debug!(error = %e, "Failed to build config packet");
            return false;
        }

        connection.send(&packet.build())
    }
}

impl Default for BlockConfigManager {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for BlockConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockConfigManager")
            .field("items", &self.items.len())
            .field("device_index", &self.device_index)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}
