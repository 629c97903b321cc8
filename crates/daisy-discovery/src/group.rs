//! One open connection and the chain of blocks behind it
//!
//! A group reassembles topology packets into a device list, keeps the version
//! and name strings blocks announce, owns the configuration table of each block
//! and queues the input events decoded from its packets. The topology source
//! drains those queues from the home loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use daisy_core::{Block, BlockConnection, BlockType, ConfigId, ConnectionPort, Uid};
use daisy_protocol::defs::NUM_PROGRAM_MESSAGE_INTS;
use daisy_protocol::{
    process_device_packet, BlockConfigManager, ConnectionInfo, DeviceCommand, DeviceConnection, DeviceStatus,
    HostMessage, HostPacketBuilder, PacketHandler, TouchEvent,
};

use crate::serial::SerialReader;
use crate::source::SourceConfig;

pub type GroupId = u64;

/// Input and acknowledgement events, addressed by topology index
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Touch(TouchEvent),
    Button {
        index: u8,
        timestamp: u32,
        button_id: u32,
        is_down: bool,
    },
    Program {
        index: u8,
        timestamp: u32,
        data: [i32; NUM_PROGRAM_MESSAGE_INTS],
    },
    Log {
        index: u8,
        message: String,
    },
    ConfigChanged {
        index: u8,
        item: ConfigId,
    },
    ConfigSyncEnded {
        index: u8,
    },
    PacketAck {
        index: u8,
        counter: u32,
    },
    FirmwareUpdateAck {
        index: u8,
        code: u8,
        detail: u32,
    },
}

impl DeviceEvent {
    pub fn index(&self) -> u8 {
        match self {
            DeviceEvent::Touch(touch) => touch.index,
            DeviceEvent::Button { index, .. }
            | DeviceEvent::Program { index, .. }
            | DeviceEvent::Log { index, .. }
            | DeviceEvent::ConfigChanged { index, .. }
            | DeviceEvent::ConfigSyncEnded { index }
            | DeviceEvent::PacketAck { index, .. }
            | DeviceEvent::FirmwareUpdateAck { index, .. } => *index,
        }
    }
}

pub struct ConnectedDeviceGroup {
    id: GroupId,
    name: String,
    connection: Arc<dyn DeviceConnection>,
    serial_reader: Option<SerialReader>,

    incoming_devices: Vec<DeviceStatus>,
    incoming_connections: Vec<ConnectionInfo>,
    current_devices: Vec<DeviceStatus>,
    current_connections: Vec<ConnectionInfo>,
    versions: HashMap<u8, String>,
    names: HashMap<u8, String>,
    configs: HashMap<Uid, BlockConfigManager>,

    topology_received: bool,
    serial_seen: bool,
    dirty: bool,
    events: Vec<DeviceEvent>,

    last_message: Instant,
    last_topology_request: Instant,
    last_ping: Instant,
}

impl ConnectedDeviceGroup {
    /// Take over `connection`, switch the master into API mode and ask for
    /// the topology
    pub fn open(
        id: GroupId,
        name: impl Into<String>,
        connection: Arc<dyn DeviceConnection>,
        config: &SourceConfig,
        now: Instant,
    ) -> Self {
        let serial_reader = config
            .serial_probe
            .then(|| SerialReader::new(connection.clone(), now));

        let group = Self {
            id,
            name: name.into(),
            connection,
            serial_reader,
            incoming_devices: Vec::new(),
            incoming_connections: Vec::new(),
            current_devices: Vec::new(),
            current_connections: Vec::new(),
            versions: HashMap::new(),
            names: HashMap::new(),
            configs: HashMap::new(),
            topology_received: false,
            serial_seen: false,
            dirty: false,
            events: Vec::new(),
            last_message: now,
            last_topology_request: now,
            last_ping: now,
        };

        group.send_messages(
            0,
            &[
                HostMessage::DeviceCommand(DeviceCommand::BeginApiMode),
                HostMessage::DeviceCommand(DeviceCommand::RequestTopologyMessage),
            ],
        );
        group
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_topology(&self) -> bool {
        self.topology_received
    }

    /// Feed one header-stripped packet body from the connection
    pub fn handle_packet(&mut self, body: &[u8], now: Instant) {
        let Some((&index_byte, data)) = body.split_first() else {
            return;
        };
        self.last_message = now;
        process_device_packet(self, index_byte, data);
    }

    /// Run timers. Returns false once the group has been silent too long.
    pub fn tick(&mut self, now: Instant, config: &SourceConfig) -> bool {
        if let Some(reader) = &mut self.serial_reader {
            reader.tick(now);
            // The probed serial may change which block is the master
            if !self.serial_seen && reader.has_serial() {
                self.serial_seen = true;
                self.dirty |= self.topology_received;
            }
        }

        if !self.topology_received
            && now.duration_since(self.last_topology_request) >= config.topology_request_interval()
        {
            trace!(group = %self.name, "Re-requesting topology");
            self.send_messages(0, &[HostMessage::DeviceCommand(DeviceCommand::RequestTopologyMessage)]);
            self.last_topology_request = now;
        }

        if now.duration_since(self.last_ping) >= config.ping_interval() {
            for index in self.current_devices.iter().map(|d| d.index).collect::<Vec<_>>() {
                self.send_messages(index, &[HostMessage::DeviceCommand(DeviceCommand::Ping)]);
            }
            self.last_ping = now;
        }

        match config.device_timeout() {
            Some(timeout) => now.duration_since(self.last_message) < timeout,
            None => true,
        }
    }

    /// Returns true once after each completed topology or announced detail
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn master_uid(&self) -> Option<Uid> {
        let probed = self
            .serial_reader
            .as_ref()
            .and_then(SerialReader::serial)
            .map(|s| s.uid())
            .filter(|uid| self.current_devices.iter().any(|d| d.serial.uid() == *uid));

        probed.or_else(|| {
            self.current_devices
                .iter()
                .find(|d| d.index == 0)
                .or_else(|| self.current_devices.first())
                .map(|d| d.serial.uid())
        })
    }

    pub fn uid_for_index(&self, index: u8) -> Option<Uid> {
        self.current_devices
            .iter()
            .find(|d| d.index == index)
            .map(|d| d.serial.uid())
    }

    pub fn index_for_uid(&self, uid: Uid) -> Option<u8> {
        self.current_devices
            .iter()
            .find(|d| d.serial.uid() == uid)
            .map(|d| d.index)
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.index_for_uid(uid).is_some()
    }

    /// Blocks of the last completed topology
    pub fn blocks(&self) -> Vec<Block> {
        let Some(master) = self.master_uid() else {
            return Vec::new();
        };

        self.current_devices
            .iter()
            .map(|device| {
                let mut block = Block::new(device.serial, device.index, master);
                block.battery_level = device.battery_level;
                block.battery_charging = device.battery_charging;
                if let Some(version) = self.versions.get(&device.index) {
                    block.version = version.clone();
                }
                if let Some(name) = self.names.get(&device.index) {
                    block.name = name.clone();
                }
                block
            })
            .collect()
    }

    pub fn connections(&self) -> Vec<BlockConnection> {
        self.current_connections
            .iter()
            .filter_map(|c| {
                let first = self.current_devices.iter().find(|d| d.index == c.device1);
                let second = self.current_devices.iter().find(|d| d.index == c.device2);
                match (first, second) {
                    (Some(a), Some(b)) => {
                        let (ua, ub) = (a.serial.uid(), b.serial.uid());
                        let ta = BlockType::from_serial(&a.serial);
                        let tb = BlockType::from_serial(&b.serial);
                        Some(BlockConnection::new(
                            ua,
                            ConnectionPort::from_wire(ta, c.port1),
                            ub,
                            ConnectionPort::from_wire(tb, c.port2),
                        ))
                    }
                    _ => {
                        debug!(group = %self.name, ?c, "Connection refers to unknown device");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn config(&self, uid: Uid) -> Option<&BlockConfigManager> {
        self.configs.get(&uid)
    }

    pub fn config_mut(&mut self, uid: Uid) -> Option<&mut BlockConfigManager> {
        self.configs.get_mut(&uid)
    }

    /// Send messages to the block at `index` in as few packets as they fit
    pub fn send_messages(&self, index: u8, messages: &[HostMessage]) -> bool {
        let mut packet = HostPacketBuilder::new(index);
        let mut ok = true;

        for message in messages {
            if packet.add(message).is_ok() {
                continue;
            }
            if !packet.is_empty() {
                ok &= self.connection.send(&packet.build());
                packet = HostPacketBuilder::new(index);
            }
            if let Err(e) = packet.add(message) {
                debug!(group = %self.name, error = %e, ?message, "Message does not fit a packet");
                ok = false;
            }
        }

        if !packet.is_empty() {
            ok &= self.connection.send(&packet.build());
        }
        ok
    }

    /// Leave API mode and release the connection
    pub fn close(self) {
        self.send_messages(0, &[HostMessage::DeviceCommand(DeviceCommand::EndApiMode)]);
        info!(group = %self.name, "Closed device group");
    }

    fn sync_configs(&mut self) {
        let present: Vec<(Uid, u8)> = self
            .current_devices
            .iter()
            .map(|d| (d.serial.uid(), d.index))
            .collect();

        self.configs
            .retain(|uid, _| present.iter().any(|(p, _)| p == uid));

        for (uid, index) in present {
            let connection = self.connection.clone();
            let manager = self.configs.entry(uid).or_insert_with(|| {
                let mut manager = BlockConfigManager::default();
                manager.set_connection(Some(connection));
                manager
            });
            manager.set_device_index(index);
        }
    }
}

impl PacketHandler for ConnectedDeviceGroup {
    fn begin_topology(&mut self, num_devices: u32, num_connections: u32) {
        self.incoming_devices.clear();
        self.incoming_connections.clear();
        self.incoming_devices.reserve(num_devices as usize);
        self.incoming_connections.reserve(num_connections as usize);
    }

    fn extend_topology(&mut self, num_devices: u32, num_connections: u32) {
        self.incoming_devices.reserve(num_devices as usize);
        self.incoming_connections.reserve(num_connections as usize);
    }

    fn topology_device(&mut self, device: &DeviceStatus) {
        self.incoming_devices.push(*device);
    }

    fn topology_connection(&mut self, connection: &ConnectionInfo) {
        self.incoming_connections.push(*connection);
    }

    fn end_topology(&mut self) {
        self.current_devices = std::mem::take(&mut self.incoming_devices);
        self.current_connections = std::mem::take(&mut self.incoming_connections);

        let indices: Vec<u8> = self.current_devices.iter().map(|d| d.index).collect();
        self.versions.retain(|index, _| indices.contains(index));
        self.names.retain(|index, _| indices.contains(index));
        self.sync_configs();

        if !self.topology_received {
            info!(group = %self.name, devices = self.current_devices.len(), "Received topology");
        }
        self.topology_received = true;
        self.dirty = true;
    }

    fn version(&mut self, index: u8, version: &str) {
        if self.versions.get(&index).map(String::as_str) != Some(version) {
            self.versions.insert(index, version.to_string());
            self.dirty = true;
        }
    }

    fn name(&mut self, index: u8, name: &str) {
        if self.names.get(&index).map(String::as_str) != Some(name) {
            self.names.insert(index, name.to_string());
            self.dirty = true;
        }
    }

    fn touch_changed(&mut self, touch: &TouchEvent) {
        self.events.push(DeviceEvent::Touch(*touch));
    }

    fn button_changed(&mut self, index: u8, timestamp: u32, button_id: u32, is_down: bool) {
        self.events.push(DeviceEvent::Button {
            index,
            timestamp,
            button_id,
            is_down,
        });
    }

    fn program_event(&mut self, index: u8, timestamp: u32, data: [i32; NUM_PROGRAM_MESSAGE_INTS]) {
        self.events.push(DeviceEvent::Program { index, timestamp, data });
    }

    fn packet_ack(&mut self, index: u8, counter: u32) {
        self.events.push(DeviceEvent::PacketAck { index, counter });
    }

    fn firmware_update_ack(&mut self, index: u8, code: u8, detail: u32) {
        self.events.push(DeviceEvent::FirmwareUpdateAck { index, code, detail });
    }

    fn config_update(&mut self, index: u8, item: u8, value: i32, min: i32, max: i32) {
        let item = ConfigId(item);
        let Some(manager) = self.uid_for_index(index).and_then(|uid| self.configs.get_mut(&uid)) else {
            debug!(group = %self.name, index, %item, "Config update for unknown block");
            return;
        };
        manager.handle_config_update(item, value, min, max);
        self.events.push(DeviceEvent::ConfigChanged { index, item });
    }

    fn config_set(&mut self, index: u8, item: u8, value: i32) {
        let item = ConfigId(item);
        let Some(manager) = self.uid_for_index(index).and_then(|uid| self.configs.get_mut(&uid)) else {
            debug!(group = %self.name, index, %item, "Config set for unknown block");
            return;
        };
        manager.handle_config_set(item, value);
        self.events.push(DeviceEvent::ConfigChanged { index, item });
    }

    fn factory_sync_end(&mut self, index: u8) {
        self.events.push(DeviceEvent::ConfigSyncEnded { index });
    }

    fn factory_sync_reset(&mut self, index: u8) {
        if let Some(manager) = self.uid_for_index(index).and_then(|uid| self.configs.get_mut(&uid)) {
            manager.reset_active_status();
        }
    }

    fn log_message(&mut self, index: u8, message: &str) {
        debug!(group = %self.name, index, message, "Block log");
        self.events.push(DeviceEvent::Log {
            index,
            message: message.to_string(),
        });
    }
}
