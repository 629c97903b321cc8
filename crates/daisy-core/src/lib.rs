//! Daisy Core - Core types for daisy-chained BLOCKS hardware
//!
//! This crate provides the foundational types shared by the protocol and
//! discovery layers:
//! - Block identity (serial numbers, UIDs, block types, connection ports)
//! - Topology snapshots and graph traversal from each master block
//! - Firmware version parsing and ordering
//! - Configuration items and the default configuration table
//! - A weak-reference listener registry

pub mod config;
pub mod device;
pub mod graph;
pub mod listeners;
pub mod topology;
pub mod version;

pub use config::{default_config, ConfigId, ConfigItem, ConfigType, ModeItem, CONFIG_MAX_OPTIONS};
pub use device::{Block, BlockType, ConnectionPort, DeviceEdge, SerialNumber, Uid, SERIAL_LENGTH};
pub use graph::{BlockFilter, BlockGraph};
pub use listeners::{ListenerId, ListenerRegistry};
pub use topology::{BlockConnection, BlockTopology};
pub use version::{BlocksVersion, ReleaseType, VersionError};
