//! Decoding of packets sent by blocks
//!
//! A packet body is the topology index byte followed by the 7-bit payload and
//! its checksum. The payload starts with a 32-bit timestamp and is followed by
//! a sequence of tagged messages, each dispatched to a [`PacketHandler`].

use thiserror::Error;
use tracing::{debug, trace};

use daisy_core::{SerialNumber, SERIAL_LENGTH};

use crate::bitstream::{checksum_is_ok, BitReader, BitstreamError};
use crate::defs::{
    bits, ConfigCommand, ConnectionInfo, DeviceStatus, MessageFromDevice, TouchEvent,
    TouchPosition, TouchVelocity, CURRENT_PROTOCOL_VERSION, MAX_BLOCKS_IN_TOPOLOGY_PACKET,
    MAX_CONNECTIONS_IN_TOPOLOGY_PACKET, MAX_NAME_LENGTH, MAX_VERSION_LENGTH,
    NUM_PROGRAM_MESSAGE_INTS, TOPOLOGY_INDEX_MASK,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Packet checksum mismatch")]
    Checksum,

    #[error("Packet too short for a timestamp")]
    MissingTimestamp,

    #[error("Unknown message type {0:#04x}")]
    UnknownMessage(u32),

    #[error("Not enough data for message type {0:#04x}")]
    Truncated(u32),

    #[error("Frame is missing the sysex header or footer")]
    InvalidFrame,

    #[error("Topology from protocol version {0} is newer than supported")]
    UnsupportedProtocol(u32),

    #[error("{kind} string of length {length} exceeds {max}")]
    StringTooLong {
        kind: &'static str,
        length: usize,
        max: usize,
    },

    #[error(transparent)]
    Bitstream(#[from] BitstreamError),
}

/// Receives messages decoded from device packets
///
/// Every method has an empty default so handlers only implement what they
/// care about. `index` is always the topology index of the sending block.
#[allow(unused_variables)]
pub trait PacketHandler {
    fn begin_topology(&mut self, num_devices: u32, num_connections: u32) {}
    fn extend_topology(&mut self, num_devices: u32, num_connections: u32) {}
    fn topology_device(&mut self, device: &DeviceStatus) {}
    fn topology_connection(&mut self, connection: &ConnectionInfo) {}
    fn end_topology(&mut self) {}

    fn version(&mut self, index: u8, version: &str) {}
    fn name(&mut self, index: u8, name: &str) {}

    fn touch_changed(&mut self, touch: &TouchEvent) {}
    fn button_changed(&mut self, index: u8, timestamp: u32, button_id: u32, is_down: bool) {}
    fn program_event(&mut self, index: u8, timestamp: u32, data: [i32; NUM_PROGRAM_MESSAGE_INTS]) {}

    fn packet_ack(&mut self, index: u8, counter: u32) {}
    fn firmware_update_ack(&mut self, index: u8, code: u8, detail: u32) {}

    fn config_update(&mut self, index: u8, item: u8, value: i32, min: i32, max: i32) {}
    fn config_set(&mut self, index: u8, item: u8, value: i32) {}
    fn factory_sync_end(&mut self, index: u8) {}
    fn factory_sync_reset(&mut self, index: u8) {}

    fn log_message(&mut self, index: u8, message: &str) {}
}

/// Decode one packet body and dispatch its messages to `handler`
///
/// A bad checksum or missing timestamp rejects the packet before anything is
/// dispatched. A malformed or unknown message stops decoding, but messages
/// already dispatched stay delivered. Returns the number of messages handled.
pub fn decode_device_packet<H: PacketHandler + ?Sized>(
    handler: &mut H,
    index_byte: u8,
    data: &[u8],
) -> Result<usize, DecodeError> {
    if !checksum_is_ok(data) {
        return Err(DecodeError::Checksum);
    }

    let payload = &data[..data.len() - 1];
    let mut reader = BitReader::new(payload);
    if reader.remaining_bits() < bits::TIMESTAMP {
        return Err(DecodeError::MissingTimestamp);
    }

    let timestamp = reader.read_bits(bits::TIMESTAMP)?;
    let index = index_byte & TOPOLOGY_INDEX_MASK;
    let mut handled = 0;

    loop {
        if reader.remaining_bits() < bits::MESSAGE_TYPE {
            break;
        }

        let tag = reader.read_bits(bits::MESSAGE_TYPE)?;
        if tag == 0 {
            break;
        }

        let message = MessageFromDevice::try_from(tag).map_err(DecodeError::UnknownMessage)?;
        trace!(index, ?message, "Decoding message");

        let mut decoder = MessageDecoder {
            handler: &mut *handler,
            reader: &mut reader,
            index,
            timestamp,
        };
        decoder.dispatch(message)?;
        handled += 1;
    }

    Ok(handled)
}

/// Like [`decode_device_packet`] but logs failures instead of returning them
pub fn process_device_packet<H: PacketHandler + ?Sized>(handler: &mut H, index_byte: u8, data: &[u8]) {
    if let Err(e) = decode_device_packet(handler, index_byte, data) {
        debug!(index = index_byte & TOPOLOGY_INDEX_MASK, error = %e, "Dropped device packet");
    }
}

struct MessageDecoder<'a, 'r, H: PacketHandler + ?Sized> {
    handler: &'a mut H,
    reader: &'a mut BitReader<'r>,
    index: u8,
    timestamp: u32,
}

impl<H: PacketHandler + ?Sized> MessageDecoder<'_, '_, H> {
    fn dispatch(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        use MessageFromDevice::*;

        match message {
            DeviceTopology => self.topology(message, true),
            DeviceTopologyExtend => self.topology(message, false),
            DeviceTopologyEnd => self.topology_end(message),
            DeviceVersion => self.announce(message, MAX_VERSION_LENGTH),
            DeviceName => self.announce(message, MAX_NAME_LENGTH),
            TouchStart => self.touch(message, true, false, false),
            TouchMove => self.touch(message, false, false, false),
            TouchEnd => self.touch(message, false, true, false),
            TouchStartWithVelocity => self.touch(message, true, false, true),
            TouchMoveWithVelocity => self.touch(message, false, false, true),
            TouchEndWithVelocity => self.touch(message, false, true, true),
            ControlButtonDown => self.button(message, true),
            ControlButtonUp => self.button(message, false),
            ProgramEvent => self.program_event(message),
            PacketAck => self.packet_ack(message),
            FirmwareUpdateAck => self.firmware_update_ack(message),
            ConfigMessage => self.config(message),
            LogMessage => self.log(),
        }
    }

    fn require(&self, message: MessageFromDevice, bits: usize) -> Result<(), DecodeError> {
        if self.reader.remaining_bits() < bits {
            return Err(DecodeError::Truncated(message as u32));
        }
        Ok(())
    }

    fn read(&mut self, bits: usize) -> Result<u32, DecodeError> {
        Ok(self.reader.read_bits(bits)?)
    }

    fn protocol_version(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.require(message, bits::PROTOCOL_VERSION)?;
        let version = self.read(bits::PROTOCOL_VERSION)?;
        if version > CURRENT_PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedProtocol(version));
        }
        Ok(())
    }

    fn topology(&mut self, message: MessageFromDevice, is_new: bool) -> Result<(), DecodeError> {
        self.require(
            message,
            bits::PROTOCOL_VERSION + bits::DEVICE_COUNT + bits::CONNECTION_COUNT,
        )?;
        self.protocol_version(message)?;

        let num_devices = self.read(bits::DEVICE_COUNT)?;
        let num_connections = self.read(bits::CONNECTION_COUNT)?;
        self.require(
            message,
            num_devices as usize * bits::TOPOLOGY_DEVICE
                + num_connections as usize * bits::TOPOLOGY_CONNECTION,
        )?;

        if is_new {
            self.handler.begin_topology(num_devices, num_connections);
        } else {
            self.handler.extend_topology(num_devices, num_connections);
        }

        for _ in 0..num_devices {
            let device = self.topology_device()?;
            self.handler.topology_device(&device);
        }

        for _ in 0..num_connections {
            let connection = ConnectionInfo {
                device1: self.read(bits::TOPOLOGY_INDEX)? as u8,
                port1: self.read(bits::CONNECTOR_PORT)? as u8,
                device2: self.read(bits::TOPOLOGY_INDEX)? as u8,
                port2: self.read(bits::CONNECTOR_PORT)? as u8,
            };
            self.handler.topology_connection(&connection);
        }

        // A full packet means more is coming, closed by a topology end message
        if num_devices < MAX_BLOCKS_IN_TOPOLOGY_PACKET
            && num_connections < MAX_CONNECTIONS_IN_TOPOLOGY_PACKET
        {
            self.handler.end_topology();
        }

        Ok(())
    }

    fn topology_device(&mut self) -> Result<DeviceStatus, DecodeError> {
        let mut serial = [0u8; SERIAL_LENGTH];
        for c in serial.iter_mut() {
            *c = self.read(bits::SERIAL_CHAR)? as u8;
        }

        Ok(DeviceStatus {
            serial: SerialNumber::from_bytes(serial),
            index: self.read(bits::TOPOLOGY_INDEX)? as u8,
            battery_level: self.read(bits::BATTERY_LEVEL)? as u8,
            battery_charging: self.read(bits::BATTERY_CHARGING)? != 0,
        })
    }

    fn topology_end(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.protocol_version(message)?;
        self.handler.end_topology();
        Ok(())
    }

    fn announce(&mut self, message: MessageFromDevice, max: usize) -> Result<(), DecodeError> {
        self.require(message, bits::TOPOLOGY_INDEX + bits::STRING_LENGTH)?;
        let index = self.read(bits::TOPOLOGY_INDEX)? as u8;
        let length = self.read(bits::STRING_LENGTH)? as usize;

        let kind = if message == MessageFromDevice::DeviceVersion {
            "Version"
        } else {
            "Name"
        };
        if length > max {
            return Err(DecodeError::StringTooLong { kind, length, max });
        }

        self.require(message, length * bits::STRING_CHAR)?;
        let text = self.reader.read_string(length)?;

        if message == MessageFromDevice::DeviceVersion {
            self.handler.version(index, &text);
        } else {
            self.handler.name(index, &text);
        }
        Ok(())
    }

    fn touch(
        &mut self,
        message: MessageFromDevice,
        is_start: bool,
        is_end: bool,
        with_velocity: bool,
    ) -> Result<(), DecodeError> {
        let needed = if with_velocity {
            bits::TOUCH_WITH_VELOCITY
        } else {
            bits::TOUCH
        };
        self.require(message, needed)?;

        let offset = self.read(bits::TIMESTAMP_OFFSET)?;
        let touch_index = self.read(bits::TOUCH_INDEX)? as u8;
        let position = TouchPosition {
            x: self.read(bits::TOUCH_X)? as u16,
            y: self.read(bits::TOUCH_Y)? as u16,
            z: self.read(bits::TOUCH_Z)? as u8,
        };

        let velocity = if with_velocity {
            TouchVelocity {
                vx: self.read(bits::VELOCITY)? as u8,
                vy: self.read(bits::VELOCITY)? as u8,
                vz: self.read(bits::VELOCITY)? as u8,
            }
        } else {
            TouchVelocity::default()
        };

        self.handler.touch_changed(&TouchEvent {
            index: self.index,
            timestamp: self.timestamp.wrapping_add(offset),
            touch_index,
            position,
            velocity,
            is_start,
            is_end,
        });
        Ok(())
    }

    fn button(&mut self, message: MessageFromDevice, is_down: bool) -> Result<(), DecodeError> {
        self.require(message, bits::BUTTON)?;
        let offset = self.read(bits::TIMESTAMP_OFFSET)?;
        let button_id = self.read(bits::BUTTON_ID)?;

        self.handler.button_changed(
            self.index,
            self.timestamp.wrapping_add(offset),
            button_id,
            is_down,
        );
        Ok(())
    }

    fn program_event(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.require(message, bits::PROGRAM_EVENT)?;
        let mut data = [0i32; NUM_PROGRAM_MESSAGE_INTS];
        for value in data.iter_mut() {
            *value = self.reader.read_signed(bits::PROGRAM_INT)?;
        }

        self.handler.program_event(self.index, self.timestamp, data);
        Ok(())
    }

    fn packet_ack(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.require(message, bits::PACKET_COUNTER)?;
        let counter = self.read(bits::PACKET_COUNTER)?;
        self.handler.packet_ack(self.index, counter);
        Ok(())
    }

    fn firmware_update_ack(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.require(message, bits::FIRMWARE_ACK_CODE + bits::FIRMWARE_ACK_DETAIL)?;
        let code = self.read(bits::FIRMWARE_ACK_CODE)? as u8;
        let detail = self.read(bits::FIRMWARE_ACK_DETAIL)?;
        self.handler.firmware_update_ack(self.index, code, detail);
        Ok(())
    }

    fn config(&mut self, message: MessageFromDevice) -> Result<(), DecodeError> {
        self.require(message, bits::CONFIG_COMMAND)?;
        let command = self.read(bits::CONFIG_COMMAND)?;

        match ConfigCommand::try_from(command) {
            Ok(ConfigCommand::UpdateConfig) => {
                self.require(message, bits::CONFIG_ITEM + 3 * bits::CONFIG_VALUE)?;
                let item = self.read(bits::CONFIG_ITEM)? as u8;
                let value = self.reader.read_signed(bits::CONFIG_VALUE)?;
                let min = self.reader.read_signed(bits::CONFIG_VALUE)?;
                let max = self.reader.read_signed(bits::CONFIG_VALUE)?;
                self.handler.config_update(self.index, item, value, min, max);
            }
            Ok(ConfigCommand::SetConfig) => {
                self.require(message, bits::CONFIG_ITEM + bits::CONFIG_VALUE)?;
                let item = self.read(bits::CONFIG_ITEM)? as u8;
                let value = self.reader.read_signed(bits::CONFIG_VALUE)?;
                self.handler.config_set(self.index, item, value);
            }
            Ok(ConfigCommand::FactorySyncEnd) => self.handler.factory_sync_end(self.index),
            Ok(ConfigCommand::FactorySyncReset) => self.handler.factory_sync_reset(self.index),
            other => trace!(index = self.index, command = ?other, "Ignoring config command"),
        }
        Ok(())
    }

    fn log(&mut self) -> Result<(), DecodeError> {
        let count = self.reader.remaining_bits() / bits::STRING_CHAR;
        let message = self.reader.read_string(count)?;
        self.handler.log_message(self.index, &message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DevicePacketBuilder;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl PacketHandler for Recorder {
        fn begin_topology(&mut self, num_devices: u32, num_connections: u32) {
            self.events.push(format!("begin {num_devices} {num_connections}"));
        }
        fn extend_topology(&mut self, num_devices: u32, num_connections: u32) {
            self.events.push(format!("extend {num_devices} {num_connections}"));
        }
        fn topology_device(&mut self, device: &DeviceStatus) {
            self.events.push(format!("device {} {}", device.index, device.serial));
        }
        fn topology_connection(&mut self, c: &ConnectionInfo) {
            self.events.push(format!("link {}:{} {}:{}", c.device1, c.port1, c.device2, c.port2));
        }
        fn end_topology(&mut self) {
            self.events.push("end".to_string());
        }
        fn version(&mut self, index: u8, version: &str) {
            self.events.push(format!("version {index} {version}"));
        }
        fn touch_changed(&mut self, touch: &TouchEvent) {
            self.events.push(format!(
                "touch {} {} {} {}",
                touch.index, touch.timestamp, touch.position.x, touch.is_start
            ));
        }
        fn button_changed(&mut self, index: u8, timestamp: u32, button_id: u32, is_down: bool) {
            self.events.push(format!("button {index} {timestamp} {button_id} {is_down}"));
        }
        fn config_update(&mut self, index: u8, item: u8, value: i32, min: i32, max: i32) {
            self.events.push(format!("update {index} {item} {value} {min} {max}"));
        }
        fn config_set(&mut self, index: u8, item: u8, value: i32) {
            self.events.push(format!("set {index} {item} {value}"));
        }
        fn factory_sync_end(&mut self, index: u8) {
            self.events.push(format!("sync end {index}"));
        }
        fn log_message(&mut self, index: u8, message: &str) {
            self.events.push(format!("log {index} {message}"));
        }
    }

    fn device(n: u8) -> DeviceStatus {
        let serial = format!("LPB{}", (b'A' + n) as char).repeat(4);
        DeviceStatus {
            serial: SerialNumber::from_str_padded(&serial),
            index: n,
            battery_level: 20,
            battery_charging: false,
        }
    }

    fn decode(index: u8, body: &[u8]) -> (Result<usize, DecodeError>, Vec<String>) {
        let mut recorder = Recorder::default();
        let result = decode_device_packet(&mut recorder, index, body);
        (result, recorder.events)
    }

    #[test]
    fn test_small_topology_ends_immediately() {
        let mut packet = DevicePacketBuilder::new(100);
        packet
            .topology(
                true,
                &[device(0), device(1)],
                &[ConnectionInfo {
                    device1: 0,
                    port1: 2,
                    device2: 1,
                    port2: 6,
                }],
            )
            .unwrap();

        let (result, events) = decode(0, &packet.data());
        assert_eq!(result, Ok(1));
        assert_eq!(events.first().map(String::as_str), Some("begin 2 1"));
        assert_eq!(events.iter().filter(|e| e.starts_with("device")).count(), 2);
        assert!(events.contains(&"link 0:2 1:6".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("end"));
    }

    #[test]
    fn test_full_topology_waits_for_end() {
        let devices: Vec<DeviceStatus> = (0..6).map(device).collect();
        let mut first = DevicePacketBuilder::new(0);
        first.topology(true, &devices, &[]).unwrap();

        let (_, events) = decode(0, &first.data());
        assert!(!events.contains(&"end".to_string()));

        let mut second = DevicePacketBuilder::new(1);
        second.topology(false, &[device(6)], &[]).unwrap();
        let (_, events) = decode(0, &second.data());
        assert_eq!(events.first().map(String::as_str), Some("extend 1 0"));
        assert!(events.contains(&"end".to_string()));

        // Explicit end after a full packet
        let mut end = DevicePacketBuilder::new(2);
        end.topology_end().unwrap();
        let (_, events) = decode(0, &end.data());
        assert_eq!(events, vec!["end".to_string()]);
    }

    #[test]
    fn test_newer_protocol_rejected() {
        let mut packet = DevicePacketBuilder::new(0);
        packet.topology_with_version(2, true, &[device(0)], &[]).unwrap();

        let (result, events) = decode(0, &packet.data());
        assert_eq!(result, Err(DecodeError::UnsupportedProtocol(2)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_corrupted_packet_is_rejected() {
        let mut packet = DevicePacketBuilder::new(1234);
        packet.version(0, "1.2.3").unwrap();
        packet.button(3, 7, true).unwrap();
        let body = packet.data();
        assert_eq!(decode(0, &body).0, Ok(2));

        for i in 0..body.len() {
            let mut corrupt = body.clone();
            corrupt[i] ^= 0x01;
            let (result, events) = decode(0, &corrupt);
            assert_eq!(result, Err(DecodeError::Checksum), "byte {i}");
            assert!(events.is_empty());
        }
    }

    #[test]
    fn test_messages_and_timestamps() {
        let mut packet = DevicePacketBuilder::new(1000);
        packet
            .touch(5, 1, TouchPosition { x: 300, y: 200, z: 10 }, None, true, false)
            .unwrap();
        packet.button(2, 9, false).unwrap();
        packet.log("hi").unwrap();

        let (result, events) = decode(0x43, &packet.data());
        assert_eq!(result, Ok(3));
        assert_eq!(
            events,
            vec![
                "touch 3 1005 300 true".to_string(),
                "button 3 1002 9 false".to_string(),
                "log 3 hi".to_string(),
            ]
        );
    }

    #[test]
    fn test_config_messages() {
        let mut packet = DevicePacketBuilder::new(0);
        packet.config_update(10, -5, -10, 127).unwrap();
        packet.config_set(3, 48).unwrap();
        packet.config_command(ConfigCommand::FactorySyncEnd).unwrap();

        let (_, events) = decode(2, &packet.data());
        assert_eq!(
            events,
            vec![
                "update 2 10 -5 -10 127".to_string(),
                "set 2 3 48".to_string(),
                "sync end 2".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_tag_keeps_earlier_messages() {
        let mut packet = DevicePacketBuilder::new(0);
        packet.version(1, "0.4.0").unwrap();
        packet.raw_tag(0x7e).unwrap();
        packet.version(1, "9.9.9").unwrap();

        let (result, events) = decode(0, &packet.data());
        assert_eq!(result, Err(DecodeError::UnknownMessage(0x7e)));
        assert_eq!(events, vec!["version 1 0.4.0".to_string()]);
    }

    #[test]
    fn test_truncated_message() {
        let mut packet = DevicePacketBuilder::new(0);
        packet.raw_tag(MessageFromDevice::TouchStart as u32).unwrap();
        let (result, events) = decode(0, &packet.data());
        assert_eq!(result, Err(DecodeError::Truncated(MessageFromDevice::TouchStart as u32)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_missing_timestamp() {
        let payload = [0x01, 0x02];
        let mut data = payload.to_vec();
        data.push(crate::bitstream::checksum(&payload));
        assert_eq!(decode(0, &data).0, Err(DecodeError::MissingTimestamp));
    }
}
