//! Daisy Discovery - finding blocks and tracking their topology
//!
//! This crate provides:
//! - Pairing of named MIDI-style endpoints into device connections
//! - Interprocess port locking so one process owns each device
//! - Serial number probing of the master block
//! - Topology reassembly per connection and a combined topology source
//! - Rule-based rewriting of a topology

pub mod connection;
pub mod group;
pub mod lock;
pub mod midi;
pub mod rules;
pub mod serial;
pub mod source;

pub use connection::MidiDeviceConnection;
pub use group::{ConnectedDeviceGroup, DeviceEvent, GroupId};
pub use lock::{lock_id, LockError, PortLock, PortLockRegistry};
pub use midi::{
    clean_device_name, find_pairs, is_blocks_device_name, EndpointInfo, EndpointPair, MidiBackend,
    MidiDeviceDetector, MidiInputCallback, MidiInputPort, MidiOutputPort,
};
pub use rules::{RuleBasedTopologySource, TopologyRule};
pub use serial::{parse_serial_response, SerialReader};
pub use source::{PhysicalTopologySource, SourceConfig, TopologyEvent, TopologyListener, TopologySource};
