//! Wire-level constants and message identifiers

use daisy_core::SerialNumber;

/// Sysex header that starts every protocol packet
pub const SYSEX_HEADER: [u8; 5] = [0xf0, 0x00, 0x21, 0x10, 0x77];
pub const SYSEX_FOOTER: u8 = 0xf7;

/// Request asking a block to dump its identity, including the serial number
pub const SERIAL_DUMP_REQUEST: [u8; 7] = [0xf0, 0x00, 0x21, 0x10, 0x78, 0x3f, 0xf7];
pub const SERIAL_DUMP_RESPONSE_HEADER: [u8; 5] = [0xf0, 0x00, 0x21, 0x10, 0x78];

pub const CURRENT_PROTOCOL_VERSION: u32 = 1;

/// Devices and connections that fit into one topology packet
pub const MAX_BLOCKS_IN_TOPOLOGY_PACKET: u32 = 6;
pub const MAX_CONNECTIONS_IN_TOPOLOGY_PACKET: u32 = 24;

/// Largest payload the host sends in one packet, in 7-bit bytes
pub const MAX_HOST_PAYLOAD: usize = 32;

/// Longest version and name strings a block announces
pub const MAX_VERSION_LENGTH: usize = 21;
pub const MAX_NAME_LENGTH: usize = 33;

pub const NUM_PROGRAM_MESSAGE_INTS: usize = 3;

/// Direction flag carried in the top bits of the index byte
pub const TOPOLOGY_INDEX_MASK: u8 = 0x3f;

/// Field widths in bits
pub mod bits {
    pub const PROTOCOL_VERSION: usize = 8;
    pub const TIMESTAMP: usize = 32;
    pub const TIMESTAMP_OFFSET: usize = 5;
    pub const MESSAGE_TYPE: usize = 7;
    pub const TOPOLOGY_INDEX: usize = 7;
    pub const DEVICE_COUNT: usize = 7;
    pub const CONNECTION_COUNT: usize = 8;
    pub const BATTERY_LEVEL: usize = 5;
    pub const BATTERY_CHARGING: usize = 1;
    pub const CONNECTOR_PORT: usize = 5;
    pub const SERIAL_CHAR: usize = 7;
    pub const STRING_LENGTH: usize = 7;
    pub const STRING_CHAR: usize = 7;
    pub const TOUCH_INDEX: usize = 5;
    pub const TOUCH_X: usize = 12;
    pub const TOUCH_Y: usize = 12;
    pub const TOUCH_Z: usize = 8;
    pub const VELOCITY: usize = 8;
    pub const BUTTON_ID: usize = 12;
    pub const PACKET_COUNTER: usize = 10;
    pub const FIRMWARE_ACK_CODE: usize = 7;
    pub const FIRMWARE_ACK_DETAIL: usize = 32;
    pub const CONFIG_COMMAND: usize = 4;
    pub const CONFIG_ITEM: usize = 8;
    pub const CONFIG_VALUE: usize = 32;
    pub const DEVICE_COMMAND: usize = 9;
    pub const PROGRAM_INT: usize = 32;

    pub const TOPOLOGY_DEVICE: usize =
        SERIAL_CHAR * daisy_core::SERIAL_LENGTH + TOPOLOGY_INDEX + BATTERY_LEVEL + BATTERY_CHARGING;
    pub const TOPOLOGY_CONNECTION: usize = 2 * (TOPOLOGY_INDEX + CONNECTOR_PORT);
    pub const TOUCH: usize = TIMESTAMP_OFFSET + TOUCH_INDEX + TOUCH_X + TOUCH_Y + TOUCH_Z;
    pub const TOUCH_WITH_VELOCITY: usize = TOUCH + 3 * VELOCITY;
    pub const BUTTON: usize = TIMESTAMP_OFFSET + BUTTON_ID;
    pub const PROGRAM_EVENT: usize = 3 * PROGRAM_INT;
}

/// Message tags sent by blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFromDevice {
    DeviceTopology = 0x01,
    PacketAck = 0x02,
    FirmwareUpdateAck = 0x03,
    DeviceTopologyExtend = 0x04,
    DeviceTopologyEnd = 0x05,
    DeviceVersion = 0x06,
    DeviceName = 0x07,
    TouchStart = 0x10,
    TouchMove = 0x11,
    TouchEnd = 0x12,
    TouchStartWithVelocity = 0x13,
    TouchMoveWithVelocity = 0x14,
    TouchEndWithVelocity = 0x15,
    ConfigMessage = 0x18,
    ControlButtonDown = 0x20,
    ControlButtonUp = 0x21,
    ProgramEvent = 0x28,
    LogMessage = 0x30,
}

impl TryFrom<u32> for MessageFromDevice {
    type Error = u32;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        use MessageFromDevice::*;
        Ok(match tag {
            0x01 => DeviceTopology,
            0x02 => PacketAck,
            0x03 => FirmwareUpdateAck,
            0x04 => DeviceTopologyExtend,
            0x05 => DeviceTopologyEnd,
            0x06 => DeviceVersion,
            0x07 => DeviceName,
            0x10 => TouchStart,
            0x11 => TouchMove,
            0x12 => TouchEnd,
            0x13 => TouchStartWithVelocity,
            0x14 => TouchMoveWithVelocity,
            0x15 => TouchEndWithVelocity,
            0x18 => ConfigMessage,
            0x20 => ControlButtonDown,
            0x21 => ControlButtonUp,
            0x28 => ProgramEvent,
            0x30 => LogMessage,
            other => return Err(other),
        })
    }
}

/// Message tags sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFromHost {
    DeviceCommand = 0x01,
    ProgramEvent = 0x03,
    ConfigMessage = 0x10,
    FactoryReset = 0x11,
    BlockReset = 0x12,
    SetName = 0x20,
}

impl TryFrom<u32> for MessageFromHost {
    type Error = u32;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        use MessageFromHost::*;
        Ok(match tag {
            0x01 => DeviceCommand,
            0x03 => ProgramEvent,
            0x10 => ConfigMessage,
            0x11 => FactoryReset,
            0x12 => BlockReset,
            0x20 => SetName,
            other => return Err(other),
        })
    }
}

/// Sub-command of a config message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommand {
    SetConfig = 0,
    RequestConfig = 1,
    RequestFactorySync = 2,
    RequestUserSync = 3,
    UpdateConfig = 4,
    UpdateUserConfig = 5,
    SetConfigState = 6,
    FactorySyncEnd = 7,
    ClusterConfigSync = 8,
    FactorySyncReset = 9,
}

impl TryFrom<u32> for ConfigCommand {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use ConfigCommand::*;
        Ok(match value {
            0 => SetConfig,
            1 => RequestConfig,
            2 => RequestFactorySync,
            3 => RequestUserSync,
            4 => UpdateConfig,
            5 => UpdateUserConfig,
            6 => SetConfigState,
            7 => FactorySyncEnd,
            8 => ClusterConfigSync,
            9 => FactorySyncReset,
            other => return Err(other),
        })
    }
}

/// Commands carried by a host device-command message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    BeginApiMode = 0,
    RequestTopologyMessage = 1,
    EndApiMode = 2,
    Ping = 3,
    DebugMode = 4,
    SaveProgramAsDefault = 5,
}

impl TryFrom<u32> for DeviceCommand {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use DeviceCommand::*;
        Ok(match value {
            0 => BeginApiMode,
            1 => RequestTopologyMessage,
            2 => EndApiMode,
            3 => Ping,
            4 => DebugMode,
            5 => SaveProgramAsDefault,
            other => return Err(other),
        })
    }
}

/// A block as listed in a topology message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub serial: SerialNumber,
    pub index: u8,
    pub battery_level: u8,
    pub battery_charging: bool,
}

/// A link between two ports as listed in a topology message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub device1: u8,
    pub port1: u8,
    pub device2: u8,
    pub port2: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchPosition {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TouchVelocity {
    pub vx: u8,
    pub vy: u8,
    pub vz: u8,
}

/// A decoded touch message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchEvent {
    pub index: u8,
    /// Packet timestamp plus the message's offset
    pub timestamp: u32,
    pub touch_index: u8,
    pub position: TouchPosition,
    /// Zero for touches sent without velocity
    pub velocity: TouchVelocity,
    pub is_start: bool,
    pub is_end: bool,
}
