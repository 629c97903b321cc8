//! Daisy Protocol - the wire protocol spoken by BLOCKS hardware
//!
//! This crate implements the host side of the protocol:
//! - Packed 7-bit bitstream reading and writing with packet checksums
//! - Decoding of device packets into [`PacketHandler`] callbacks
//! - Building host command packets (and device packets for simulation)
//! - Transport traits implemented by concrete connections
//! - The per-block configuration synchronizer

pub mod bitstream;
pub mod builder;
pub mod config_sync;
pub mod decoder;
pub mod defs;
pub mod transport;

pub use bitstream::{checksum, checksum_is_ok, BitReader, BitWriter, BitstreamError};
pub use builder::{parse_host_packet, BuildError, DevicePacketBuilder, HostMessage, HostPacketBuilder};
pub use config_sync::BlockConfigManager;
pub use decoder::{decode_device_packet, process_device_packet, DecodeError, PacketHandler};
pub use defs::{
    ConfigCommand, ConnectionInfo, DeviceCommand, DeviceStatus, MessageFromDevice, MessageFromHost,
    TouchEvent, TouchPosition, TouchVelocity,
};
pub use transport::{ConnectionListener, DeviceConnection, DeviceDetector, MessageHandler, TransportError};
