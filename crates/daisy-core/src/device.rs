//! Block identity types: serial numbers, UIDs, block types and connection ports

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Number of characters in a block serial number
pub const SERIAL_LENGTH: usize = 16;

/// Unique identifier for a block, derived from its serial number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u64);

impl Uid {
    /// Fold a full serial number into a UID
    pub fn from_serial_bytes(serial: &[u8; SERIAL_LENGTH]) -> Self {
        let mut n: u64 = 0;
        for &b in serial {
            n = n.wrapping_add(n.wrapping_mul(127).wrapping_add(u64::from(b)));
        }
        Self(n)
    }

    pub fn from_serial(serial: &SerialNumber) -> Self {
        Self::from_serial_bytes(serial.as_bytes())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-length, 7-bit clean block serial number
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SerialNumber([u8; SERIAL_LENGTH]);

impl SerialNumber {
    /// Build from raw bytes as read off the wire (top bit is dropped)
    pub fn from_bytes(bytes: [u8; SERIAL_LENGTH]) -> Self {
        Self(bytes.map(|b| b & 0x7f))
    }

    /// Build from a string, right-padding short serials with '0'
    pub fn from_str_padded(serial: &str) -> Self {
        if serial.len() < SERIAL_LENGTH {
            debug!(serial, "Serial number shorter than {} characters, padding", SERIAL_LENGTH);
        }

        let mut bytes = [b'0'; SERIAL_LENGTH];
        for (slot, b) in bytes.iter_mut().zip(serial.bytes()) {
            *slot = b & 0x7f;
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SERIAL_LENGTH] {
        &self.0
    }

    pub fn uid(&self) -> Uid {
        Uid::from_serial(self)
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix.as_bytes())
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialNumber({})", self)
    }
}

impl From<String> for SerialNumber {
    fn from(s: String) -> Self {
        Self::from_str_padded(&s)
    }
}

impl From<SerialNumber> for String {
    fn from(s: SerialNumber) -> Self {
        s.to_string()
    }
}

/// Kind of block hardware, identified by the serial-number prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Lightpad,
    Seaboard,
    Live,
    Loop,
    Developer,
    Touch,
    LumiKeys,
    Unknown,
}

impl BlockType {
    pub fn from_serial(serial: &SerialNumber) -> Self {
        const PREFIXES: [(&str, BlockType); 8] = [
            ("LPB", BlockType::Lightpad),
            ("LPM", BlockType::Lightpad),
            ("SBB", BlockType::Seaboard),
            ("LKB", BlockType::Live),
            ("LCB", BlockType::Loop),
            ("DCB", BlockType::Developer),
            ("TCB", BlockType::Touch),
            ("LKM", BlockType::LumiKeys),
        ];

        PREFIXES
            .iter()
            .find(|(prefix, _)| serial.starts_with(prefix))
            .map(|(_, t)| *t)
            .unwrap_or(BlockType::Unknown)
    }

    /// Control blocks are the half-size button blocks
    pub fn is_control_block(self) -> bool {
        matches!(
            self,
            BlockType::Live | BlockType::Loop | BlockType::Touch | BlockType::Developer
        )
    }

    /// Number of ports on each edge, clockwise from north
    pub fn ports_per_edge(self) -> [u8; 4] {
        match self {
            BlockType::Lightpad | BlockType::Unknown => [2, 2, 2, 2],
            BlockType::Live | BlockType::Loop | BlockType::Touch | BlockType::Developer => {
                [2, 1, 2, 1]
            }
            BlockType::Seaboard | BlockType::LumiKeys => [0, 1, 0, 1],
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BlockType::Lightpad => "Lightpad BLOCK",
            BlockType::Seaboard => "Seaboard BLOCK",
            BlockType::Live => "Live BLOCK",
            BlockType::Loop => "Loop BLOCK",
            BlockType::Developer => "Developer Control BLOCK",
            BlockType::Touch => "Touch BLOCK",
            BlockType::LumiKeys => "LUMI Keys BLOCK",
            BlockType::Unknown => "Unknown BLOCK",
        }
    }
}

/// Edge of a block that a port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEdge {
    North,
    East,
    South,
    West,
}

const EDGES: [DeviceEdge; 4] = [
    DeviceEdge::North,
    DeviceEdge::East,
    DeviceEdge::South,
    DeviceEdge::West,
];

/// A physical connector on a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionPort {
    pub edge: DeviceEdge,
    pub index: u8,
}

impl ConnectionPort {
    pub fn new(edge: DeviceEdge, index: u8) -> Self {
        Self { edge, index }
    }

    /// Map a wire port number onto an edge/index pair for the given block type
    pub fn from_wire(block_type: BlockType, port: u8) -> Self {
        let mut remaining = port;
        for (edge, count) in EDGES.iter().zip(block_type.ports_per_edge()) {
            if remaining < count {
                return Self::new(*edge, remaining);
            }
            remaining -= count;
        }

        debug!(port, ?block_type, "Port number outside block layout");
        Self::new(DeviceEdge::North, 0)
    }
}

/// Descriptor of a block in the current topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Identity derived from the serial number
    pub uid: Uid,
    /// Index within the current topology snapshot
    pub index: u8,
    pub serial: SerialNumber,
    pub block_type: BlockType,
    /// Firmware version string as announced by the block
    pub version: String,
    /// Display name as announced by the block
    pub name: String,
    /// Raw 5-bit battery level
    pub battery_level: u8,
    pub battery_charging: bool,
    /// UID of the master block this block is reached through
    pub master_uid: Uid,
    pub is_master: bool,
}

impl Block {
    /// Maximum raw battery level reported by the protocol
    pub const MAX_BATTERY_LEVEL: u8 = 31;

    pub fn new(serial: SerialNumber, index: u8, master_uid: Uid) -> Self {
        let uid = serial.uid();
        Self {
            uid,
            index,
            serial,
            block_type: BlockType::from_serial(&serial),
            version: String::new(),
            name: String::new(),
            battery_level: 0,
            battery_charging: false,
            master_uid,
            is_master: uid == master_uid,
        }
    }

    /// Battery level in the range 0.0 to 1.0
    pub fn battery_level_normalised(&self) -> f32 {
        f32::from(self.battery_level.min(Self::MAX_BATTERY_LEVEL)) / f32::from(Self::MAX_BATTERY_LEVEL)
    }

    pub fn is_control_block(&self) -> bool {
        self.block_type.is_control_block()
    }

    pub fn port_from_wire(&self, port: u8) -> ConnectionPort {
        ConnectionPort::from_wire(self.block_type, port)
    }

    pub fn device_description(&self) -> String {
        if self.name.is_empty() {
            self.block_type.description().to_string()
        } else {
            self.name.clone()
        }
    }
}
