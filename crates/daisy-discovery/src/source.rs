//! Topology sources
//!
//! [`PhysicalTopologySource`] owns every open device group. It is driven from a
//! single home task: transport callbacks only push packet bodies into a channel,
//! and [`TopologySource::tick`] drains that channel, runs the timers, rebuilds
//! the topology snapshot and notifies listeners.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use daisy_core::{Block, BlockTopology, ConfigId, ListenerId, ListenerRegistry, Uid};
use daisy_protocol::defs::NUM_PROGRAM_MESSAGE_INTS;
use daisy_protocol::{BlockConfigManager, DeviceDetector, HostMessage, TouchEvent};

use crate::group::{ConnectedDeviceGroup, DeviceEvent, GroupId};
use crate::lock::PortLockRegistry;
use crate::midi::{MidiBackend, MidiDeviceDetector};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timing and locking settings for a physical topology source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// How often the detector is rescanned for new or vanished devices
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Period of the home loop when no packets arrive
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Delay between topology requests until the first topology arrives
    #[serde(default = "default_topology_request_interval")]
    pub topology_request_interval_ms: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    /// Silence after which a group is closed (0 to disable)
    #[serde(default = "default_device_timeout")]
    pub device_timeout_ms: u64,
    /// Longest wait for the interprocess port lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    /// Ask the master block for its serial number
    #[serde(default = "default_true")]
    pub serial_probe: bool,
    /// Directory holding the port lock files (system temp dir if unset)
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
            tick_interval_ms: default_tick_interval(),
            topology_request_interval_ms: default_topology_request_interval(),
            ping_interval_ms: default_ping_interval(),
            device_timeout_ms: default_device_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            serial_probe: true,
            lock_dir: None,
        }
    }
}

fn default_scan_interval() -> u64 {
    1000
}

fn default_tick_interval() -> u64 {
    10
}

fn default_topology_request_interval() -> u64 {
    1000
}

fn default_ping_interval() -> u64 {
    400
}

fn default_device_timeout() -> u64 {
    5000
}

fn default_lock_timeout() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn topology_request_interval(&self) -> Duration {
        Duration::from_millis(self.topology_request_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn device_timeout(&self) -> Option<Duration> {
        (self.device_timeout_ms > 0).then(|| Duration::from_millis(self.device_timeout_ms))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_registry(&self) -> PortLockRegistry {
        match &self.lock_dir {
            Some(dir) => PortLockRegistry::new(dir, self.lock_timeout()),
            None => PortLockRegistry::in_temp_dir(self.lock_timeout()),
        }
    }
}

/// Observer of a topology source. Every method has an empty default.
pub trait TopologyListener: Send + Sync {
    fn topology_changed(&self, _topology: &BlockTopology) {}
    fn block_added(&self, _block: &Block) {}
    fn block_removed(&self, _block: &Block) {}
    fn block_updated(&self, _block: &Block) {}

    fn touch_changed(&self, _uid: Uid, _touch: &TouchEvent) {}
    fn button_changed(&self, _uid: Uid, _timestamp: u32, _button_id: u32, _is_down: bool) {}
    fn program_event(&self, _uid: Uid, _timestamp: u32, _data: &[i32; NUM_PROGRAM_MESSAGE_INTS]) {}
    fn log_message(&self, _uid: Uid, _message: &str) {}

    fn config_changed(&self, _uid: Uid, _item: ConfigId) {}
    fn config_sync_ended(&self, _uid: Uid) {}
    fn packet_ack(&self, _uid: Uid, _counter: u32) {}
    fn firmware_update_ack(&self, _uid: Uid, _code: u8, _detail: u32) {}
}

pub trait TopologySource {
    fn current_topology(&self) -> BlockTopology;

    fn set_active(&mut self, active: bool);
    fn is_active(&self) -> bool;

    /// True if a device is present but held by another process
    fn is_locked_from_outside(&self) -> bool {
        false
    }

    fn add_listener(&mut self, listener: &Arc<dyn TopologyListener>) -> ListenerId;
    fn remove_listener(&mut self, id: ListenerId);

    /// Process pending input and run timers
    fn tick(&mut self, now: Instant);
}

/// Everything a topology source reports, also available as a broadcast stream
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    TopologyChanged(BlockTopology),
    BlockAdded(Block),
    BlockRemoved(Block),
    BlockUpdated(Block),
    Touch {
        uid: Uid,
        touch: TouchEvent,
    },
    Button {
        uid: Uid,
        timestamp: u32,
        button_id: u32,
        is_down: bool,
    },
    Program {
        uid: Uid,
        timestamp: u32,
        data: [i32; NUM_PROGRAM_MESSAGE_INTS],
    },
    Log {
        uid: Uid,
        message: String,
    },
    ConfigChanged {
        uid: Uid,
        item: ConfigId,
    },
    ConfigSyncEnded {
        uid: Uid,
    },
    PacketAck {
        uid: Uid,
        counter: u32,
    },
    FirmwareUpdateAck {
        uid: Uid,
        code: u8,
        detail: u32,
    },
}

impl TopologyEvent {
    fn from_device(uid: Uid, event: DeviceEvent) -> Self {
        match event {
            DeviceEvent::Touch(touch) => TopologyEvent::Touch { uid, touch },
            DeviceEvent::Button {
                timestamp,
                button_id,
                is_down,
                ..
            } => TopologyEvent::Button {
                uid,
                timestamp,
                button_id,
                is_down,
            },
            DeviceEvent::Program { timestamp, data, .. } => TopologyEvent::Program { uid, timestamp, data },
            DeviceEvent::Log { message, .. } => TopologyEvent::Log { uid, message },
            DeviceEvent::ConfigChanged { item, .. } => TopologyEvent::ConfigChanged { uid, item },
            DeviceEvent::ConfigSyncEnded { .. } => TopologyEvent::ConfigSyncEnded { uid },
            DeviceEvent::PacketAck { counter, .. } => TopologyEvent::PacketAck { uid, counter },
            DeviceEvent::FirmwareUpdateAck { code, detail, .. } => {
                TopologyEvent::FirmwareUpdateAck { uid, code, detail }
            }
        }
    }

    /// Call the matching listener method
    pub fn dispatch(&self, listener: &dyn TopologyListener) {
        match self {
            TopologyEvent::TopologyChanged(topology) => listener.topology_changed(topology),
            TopologyEvent::BlockAdded(block) => listener.block_added(block),
            TopologyEvent::BlockRemoved(block) => listener.block_removed(block),
            TopologyEvent::BlockUpdated(block) => listener.block_updated(block),
            TopologyEvent::Touch { uid, touch } => listener.touch_changed(*uid, touch),
            TopologyEvent::Button {
                uid,
                timestamp,
                button_id,
                is_down,
            } => listener.button_changed(*uid, *timestamp, *button_id, *is_down),
            TopologyEvent::Program { uid, timestamp, data } => listener.program_event(*uid, *timestamp, data),
            TopologyEvent::Log { uid, message } => listener.log_message(*uid, message),
            TopologyEvent::ConfigChanged { uid, item } => listener.config_changed(*uid, *item),
            TopologyEvent::ConfigSyncEnded { uid } => listener.config_sync_ended(*uid),
            TopologyEvent::PacketAck { uid, counter } => listener.packet_ack(*uid, *counter),
            TopologyEvent::FirmwareUpdateAck { uid, code, detail } => {
                listener.firmware_update_ack(*uid, *code, *detail)
            }
        }
    }
}

/// Same blocks in the same roles, joined the same way
fn same_structure(a: &BlockTopology, b: &BlockTopology) -> bool {
    a.blocks.len() == b.blocks.len()
        && a.blocks.iter().all(|x| {
            b.block_with_uid(x.uid)
                .is_some_and(|y| y.master_uid == x.master_uid && y.is_master == x.is_master)
        })
        && a.connections.len() == b.connections.len()
        && a.connections.iter().all(|c| b.connections.contains(c))
}

struct InboundPacket {
    group: GroupId,
    body: Vec<u8>,
}

/// Topology of the blocks reachable through a [`DeviceDetector`]
pub struct PhysicalTopologySource {
    detector: Arc<dyn DeviceDetector>,
    config: SourceConfig,
    groups: Vec<ConnectedDeviceGroup>,
    topology: BlockTopology,
    listeners: ListenerRegistry<dyn TopologyListener>,
    event_tx: broadcast::Sender<TopologyEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    inbound_rx: mpsc::UnboundedReceiver<InboundPacket>,
    active: bool,
    last_scan: Option<Instant>,
    next_group_id: GroupId,
}

impl PhysicalTopologySource {
    /// Create an active source. The first tick scans for devices.
    pub fn new(detector: Arc<dyn DeviceDetector>, config: SourceConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Self {
            detector,
            config,
            groups: Vec::new(),
            topology: BlockTopology::new(),
            listeners: ListenerRegistry::new(),
            event_tx,
            inbound_tx,
            inbound_rx,
            active: true,
            last_scan: None,
            next_group_id: 0,
        }
    }

    /// Source over named MIDI endpoints, locked per `config`
    pub fn with_midi_backend(backend: Arc<dyn MidiBackend>, config: SourceConfig) -> Self {
        let detector = MidiDeviceDetector::new(backend, config.lock_registry());
        Self::new(Arc::new(detector), config)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Subscribe to every notification this source makes
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_tx.subscribe()
    }

    /// Number of open device connections
    pub fn connection_count(&self) -> usize {
        self.groups.len()
    }

    pub fn config_manager(&self, uid: Uid) -> Option<&BlockConfigManager> {
        self.groups.iter().find_map(|g| g.config(uid))
    }

    pub fn config_manager_mut(&mut self, uid: Uid) -> Option<&mut BlockConfigManager> {
        self.groups.iter_mut().find_map(|g| g.config_mut(uid))
    }

    /// Send host messages to a block. False if the block is unknown or the
    /// send failed.
    pub fn send_to_block(&self, uid: Uid, messages: &[HostMessage]) -> bool {
        let Some((group, index)) = self
            .groups
            .iter()
            .find_map(|g| g.index_for_uid(uid).map(|index| (g, index)))
        else {
            debug!(%uid, "No connection to block");
            return false;
        };
        group.send_messages(index, messages)
    }

    /// Drive the source forever from a tokio interval, waking early when a
    /// packet arrives
    pub async fn run(&mut self) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            scan_interval_ms = self.config.scan_interval_ms,
            tick_interval_ms = self.config.tick_interval_ms,
            "Topology source running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(packet) = self.inbound_rx.recv() => {
                    self.route(packet, Instant::now());
                }
            }
            self.tick(Instant::now());
        }
    }

    fn route(&mut self, packet: InboundPacket, now: Instant) {
        match self.groups.iter_mut().find(|g| g.id() == packet.group) {
            Some(group) => group.handle_packet(&packet.body, now),
            None => trace!(group = packet.group, "Packet for closed connection"),
        }
    }

    /// Open new devices and close vanished ones. Returns true if a group
    /// was closed.
    fn rescan(&mut self, now: Instant) -> bool {
        let names = self.detector.scan();
        let mut closed = false;

        let (keep, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.groups)
            .into_iter()
            .partition(|g| names.iter().any(|n| n == g.name()));
        self.groups = keep;

        for group in gone {
            info!(device = %group.name(), "Device disconnected");
            group.close();
            closed = true;
        }

        for (index, name) in names.iter().enumerate() {
            if self.groups.iter().any(|g| g.name() == name) {
                continue;
            }

            let Some(connection) = self.detector.open(index) else {
                continue;
            };

            let id = self.next_group_id;
            self.next_group_id += 1;

            let tx = self.inbound_tx.clone();
            connection.set_message_handler(Some(Box::new(move |body| {
                let _ = tx.send(InboundPacket {
                    group: id,
                    body: body.to_vec(),
                });
            })));

            info!(device = %name, group = id, "Device connected");
            self.groups
                .push(ConnectedDeviceGroup::open(id, name.clone(), connection, &self.config, now));
        }

        closed
    }

    fn close_all(&mut self) {
        for group in std::mem::take(&mut self.groups) {
            group.close();
        }
        while self.inbound_rx.try_recv().is_ok() {}
    }

    fn rebuild(&mut self) {
        let mut topology = BlockTopology::new();
        for group in &self.groups {
            for block in group.blocks() {
                topology.add_block(block);
            }
            for connection in group.connections() {
                topology.add_connection(connection);
            }
        }

        let old = std::mem::replace(&mut self.topology, topology);
        let new = &self.topology;

        let mut events: Vec<TopologyEvent> = new
            .blocks
            .iter()
            .filter(|b| old.block_with_uid(b.uid).is_none())
            .cloned()
            .map(TopologyEvent::BlockAdded)
            .collect();

        events.extend(
            old.blocks
                .iter()
                .filter(|b| new.block_with_uid(b.uid).is_none())
                .cloned()
                .map(TopologyEvent::BlockRemoved),
        );

        events.extend(
            new.blocks
                .iter()
                .filter(|b| old.block_with_uid(b.uid).is_some_and(|prev| prev != *b))
                .cloned()
                .map(TopologyEvent::BlockUpdated),
        );

        if !same_structure(&old, new) {
            info!(
                blocks = new.blocks.len(),
                connections = new.connections.len(),
                "Topology changed"
            );
            events.push(TopologyEvent::TopologyChanged(new.clone()));
        }

        for event in events {
            self.notify(event);
        }
    }

    fn device_events(&mut self) -> Vec<TopologyEvent> {
        let mut events = Vec::new();
        for group in &mut self.groups {
            for event in group.drain_events() {
                match group.uid_for_index(event.index()) {
                    Some(uid) => events.push(TopologyEvent::from_device(uid, event)),
                    None => trace!(index = event.index(), "Event from block outside topology"),
                }
            }
        }
        events
    }

    fn notify(&mut self, event: TopologyEvent) {
        for listener in self.listeners.snapshot() {
            event.dispatch(listener.as_ref());
        }
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

impl TopologySource for PhysicalTopologySource {
    fn current_topology(&self) -> BlockTopology {
        self.topology.clone()
    }

    fn set_active(&mut self, active: bool) {
        if active == self.active {
            return;
        }
        self.active = active;

        if active {
            info!("Topology source activated");
            self.last_scan = None;
        } else {
            info!("Topology source deactivated");
            self.close_all();
            self.rebuild();
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_locked_from_outside(&self) -> bool {
        self.detector.is_locked_from_outside()
    }

    fn add_listener(&mut self, listener: &Arc<dyn TopologyListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn tick(&mut self, now: Instant) {
        if !self.active {
            while self.inbound_rx.try_recv().is_ok() {}
            return;
        }

        let mut changed = false;

        if self
            .last_scan
            .is_none_or(|last| now.duration_since(last) >= self.config.scan_interval())
        {
            changed |= self.rescan(now);
            self.last_scan = Some(now);
        }

        while let Ok(packet) = self.inbound_rx.try_recv() {
            self.route(packet, now);
        }

        for mut group in std::mem::take(&mut self.groups) {
            if group.tick(now, &self.config) {
                self.groups.push(group);
            } else {
                warn!(device = %group.name(), "Device stopped responding");
                group.close();
                changed = true;
            }
        }

        for group in &mut self.groups {
            changed |= group.take_dirty();
        }

        if changed {
            self.rebuild();
        }

        for event in self.device_events() {
            self.notify(event);
        }
    }
}

impl Drop for PhysicalTopologySource {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::group::tests::{body, link, status};
    use crate::midi::tests::MemoryBackend;
    use daisy_protocol::{parse_host_packet, DeviceCommand, DeviceConnection, DevicePacketBuilder, MessageHandler};
    use parking_lot::Mutex;

    /// Connection whose inbound side is driven by the test
    pub(crate) struct FakeConnection {
        name: String,
        handler: Mutex<Option<MessageHandler>>,
        pub sent: Mutex<Vec<Vec<u8>>>,
        /// Delivered once, in answer to the first frame sent
        reply: Mutex<Option<Vec<u8>>>,
    }

    impl FakeConnection {
        pub fn new(name: &str) -> Arc<Self> {
            Self::replying(name, None)
        }

        pub fn replying(name: &str, reply: Option<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                handler: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                reply: Mutex::new(reply),
            })
        }

        pub fn deliver(&self, body: &[u8]) {
            if let Some(handler) = &*self.handler.lock() {
                handler(body);
            }
        }
    }

    impl DeviceConnection for FakeConnection {
        fn send(&self, frame: &[u8]) -> bool {
            self.sent.lock().push(frame.to_vec());
            if let Some(reply) = self.reply.lock().take() {
                self.deliver(&reply);
            }
            true
        }

        fn set_message_handler(&self, handler: Option<MessageHandler>) {
            *self.handler.lock() = handler;
        }

        fn name(&self) -> String {
            self.name.clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDetector {
        pub devices: Mutex<Vec<Arc<FakeConnection>>>,
    }

    impl FakeDetector {
        pub fn with(devices: Vec<Arc<FakeConnection>>) -> Arc<Self> {
            Arc::new(Self {
                devices: Mutex::new(devices),
            })
        }
    }

    impl DeviceDetector for FakeDetector {
        fn scan(&self) -> Vec<String> {
            self.devices.lock().iter().map(|d| d.name.clone()).collect()
        }

        fn open(&self, index: usize) -> Option<Arc<dyn DeviceConnection>> {
            let device = self.devices.lock().get(index).cloned()?;
            Some(device as Arc<dyn DeviceConnection>)
        }
    }

    /// Listener recording a short description of every callback
    #[derive(Default)]
    pub(crate) struct Log {
        pub entries: Mutex<Vec<String>>,
    }

    impl Log {
        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.entries.lock())
        }
    }

    impl TopologyListener for Log {
        fn topology_changed(&self, topology: &BlockTopology) {
            self.entries.lock().push(format!("changed {}", topology.blocks.len()));
        }

        fn block_added(&self, block: &Block) {
            self.entries.lock().push(format!("added {}", block.index));
        }

        fn block_removed(&self, block: &Block) {
            self.entries.lock().push(format!("removed {}", block.index));
        }

        fn block_updated(&self, block: &Block) {
            self.entries.lock().push(format!("updated {} {}", block.index, block.name));
        }

        fn button_changed(&self, uid: Uid, timestamp: u32, button_id: u32, is_down: bool) {
            self.entries
                .lock()
                .push(format!("button {uid} {timestamp} {button_id} {is_down}"));
        }
    }

    fn quiet_config() -> SourceConfig {
        SourceConfig {
            serial_probe: false,
            ..SourceConfig::default()
        }
    }

    fn two_block_topology() -> Vec<u8> {
        let mut packet = DevicePacketBuilder::new(0);
        packet
            .topology(
                true,
                &[status("LPBAAAAAAAAAAAAA", 0), status("LPBBBBBBBBBBBBBB", 1)],
                &[link(0, 1, 1, 3)],
            )
            .unwrap();
        body(0, &packet)
    }

    fn listen(source: &mut PhysicalTopologySource) -> Arc<Log> {
        let log = Arc::new(Log::default());
        let listener: Arc<dyn TopologyListener> = log.clone();
        source.add_listener(&listener);
        log
    }

    #[test]
    fn test_config_defaults_from_toml_style_input() {
        let config: SourceConfig = serde_json::from_str(r#"{"ping_interval_ms": 250}"#).unwrap();
        assert_eq!(config.ping_interval(), Duration::from_millis(250));
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
        assert_eq!(config.lock_timeout(), Duration::from_millis(500));
        assert!(config.serial_probe);

        let disabled = SourceConfig {
            device_timeout_ms: 0,
            ..SourceConfig::default()
        };
        assert!(disabled.device_timeout().is_none());
    }

    #[test]
    fn test_connect_update_and_disconnect() {
        let device = FakeConnection::new("Lightpad BLOCK");
        let detector = FakeDetector::with(vec![device.clone()]);
        let mut source = PhysicalTopologySource::new(detector.clone(), quiet_config());
        let log = listen(&mut source);

        let start = Instant::now();
        source.tick(start);
        assert_eq!(source.connection_count(), 1);
        let (index, messages) = parse_host_packet(&device.sent.lock()[0]).unwrap();
        assert_eq!(index, 0);
        assert_eq!(messages[0], HostMessage::DeviceCommand(DeviceCommand::BeginApiMode));
        assert!(log.take().is_empty());

        device.deliver(&two_block_topology());
        source.tick(start + Duration::from_millis(10));
        assert_eq!(log.take(), vec!["added 0", "added 1", "changed 2"]);

        let topology = source.current_topology();
        assert_eq!(topology.blocks.len(), 2);
        assert_eq!(topology.connections.len(), 1);
        assert_eq!(topology.masters().count(), 1);

        // A name announcement updates the block without changing the shape
        let mut packet = DevicePacketBuilder::new(5);
        packet.name(1, "Left").unwrap();
        packet.button(2, 7, true).unwrap();
        device.deliver(&body(0, &packet));
        source.tick(start + Duration::from_millis(20));

        let master = topology.blocks[0].uid;
        assert_eq!(
            log.take(),
            vec!["updated 1 Left".to_string(), format!("button {master} 7 7 true")]
        );

        detector.devices.lock().clear();
        source.tick(start + Duration::from_secs(2));
        assert_eq!(log.take(), vec!["removed 0", "removed 1", "changed 0"]);
        assert_eq!(source.connection_count(), 0);
        assert!(source.current_topology().is_empty());
    }

    #[test]
    fn test_deactivate_clears_topology() {
        let device = FakeConnection::new("Lightpad BLOCK");
        let mut source = PhysicalTopologySource::new(FakeDetector::with(vec![device.clone()]), quiet_config());
        let mut events = source.subscribe();

        let start = Instant::now();
        source.tick(start);
        device.deliver(&two_block_topology());
        source.tick(start);

        source.set_active(false);
        assert!(!source.is_active());
        assert!(source.current_topology().is_empty());
        assert_eq!(source.connection_count(), 0);

        // Inactive sources ignore the detector
        source.tick(start + Duration::from_secs(5));
        assert_eq!(source.connection_count(), 0);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(received.last(), Some(TopologyEvent::TopologyChanged(t)) if t.is_empty()));
        assert_eq!(
            received
                .iter()
                .filter(|e| matches!(e, TopologyEvent::BlockRemoved(_)))
                .count(),
            2
        );

        source.set_active(true);
        source.tick(start + Duration::from_secs(6));
        assert_eq!(source.connection_count(), 1);
    }

    #[test]
    fn test_config_messages_reach_block() {
        let device = FakeConnection::new("Lightpad BLOCK");
        let mut source = PhysicalTopologySource::new(FakeDetector::with(vec![device.clone()]), quiet_config());

        let start = Instant::now();
        source.tick(start);
        device.deliver(&two_block_topology());
        source.tick(start);

        let follower = source.current_topology().blocks[1].uid;
        device.sent.lock().clear();
        assert!(source
            .config_manager_mut(follower)
            .unwrap()
            .set_item_value(ConfigId::VOLUME, 80));
        assert!(source.send_to_block(follower, &[HostMessage::BlockReset]));
        assert!(!source.send_to_block(Uid(1), &[HostMessage::BlockReset]));

        let sent: Vec<(u8, Vec<HostMessage>)> = device
            .sent
            .lock()
            .iter()
            .map(|frame| parse_host_packet(frame).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                (1, vec![HostMessage::ConfigSet { item: 21, value: 80 }]),
                (1, vec![HostMessage::BlockReset]),
            ]
        );
    }

    #[test]
    fn test_midi_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::default());
        backend.add_device("Lightpad BLOCK", "pad");

        let config = SourceConfig {
            lock_dir: Some(dir.path().to_path_buf()),
            ..quiet_config()
        };
        let mut source = PhysicalTopologySource::with_midi_backend(backend.clone(), config);

        let start = Instant::now();
        source.tick(start);
        assert_eq!(source.connection_count(), 1);
        assert!(!backend.sent_to("pad").is_empty());

        let body = two_block_topology();
        let mut frame = daisy_protocol::defs::SYSEX_HEADER.to_vec();
        frame.extend_from_slice(&body);
        frame.push(daisy_protocol::defs::SYSEX_FOOTER);
        backend.inject("pad", &frame);

        source.tick(start + Duration::from_millis(10));
        assert_eq!(source.current_topology().blocks.len(), 2);
        assert!(!source.is_locked_from_outside());
    }

    #[tokio::test]
    async fn test_run_reports_topology() {
        let device = FakeConnection::replying("Lightpad BLOCK", Some(two_block_topology()));
        let mut source = PhysicalTopologySource::new(FakeDetector::with(vec![device]), quiet_config());
        let mut events = source.subscribe();

        let _ = tokio::time::timeout(Duration::from_millis(100), source.run()).await;

        let mut added = 0;
        let mut changed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TopologyEvent::BlockAdded(_) => added += 1,
                TopologyEvent::TopologyChanged(t) => changed = t.blocks.len() == 2,
                _ => {}
            }
        }
        assert_eq!(added, 2);
        assert!(changed);
    }
}
