//! Packet construction
//!
//! [`HostPacketBuilder`] composes the commands the host sends to a block.
//! [`parse_host_packet`] reads such a packet back, and [`DevicePacketBuilder`]
//! produces packets in the block's own format. The last two are used by
//! simulated devices and tests.

use thiserror::Error;

use crate::bitstream::{checksum, checksum_is_ok, BitReader, BitWriter, BitstreamError};
use crate::decoder::DecodeError;
use crate::defs::{
    bits, ConfigCommand, ConnectionInfo, DeviceCommand, DeviceStatus, MessageFromDevice,
    MessageFromHost, TouchPosition, TouchVelocity, CURRENT_PROTOCOL_VERSION, MAX_HOST_PAYLOAD,
    MAX_NAME_LENGTH, MAX_VERSION_LENGTH, NUM_PROGRAM_MESSAGE_INTS, SYSEX_FOOTER, SYSEX_HEADER,
    TOPOLOGY_INDEX_MASK,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Packet full: {needed} bits needed, {available} available")]
    Full { needed: usize, available: usize },

    #[error("String of {length} characters exceeds {max}")]
    StringTooLong { length: usize, max: usize },

    #[error("String contains characters outside 7-bit ASCII")]
    NotAscii,

    #[error(transparent)]
    Bitstream(#[from] BitstreamError),
}

/// A command sent from the host to a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    ConfigSet { item: u8, value: i32 },
    ConfigRequest { item: u8 },
    FactorySyncRequest,
    UserSyncRequest,
    DeviceCommand(DeviceCommand),
    FactoryReset,
    BlockReset,
    SetName(String),
    ProgramEvent([i32; NUM_PROGRAM_MESSAGE_INTS]),
}

impl HostMessage {
    fn size_in_bits(&self) -> usize {
        let body = match self {
            HostMessage::ConfigSet { .. } => bits::CONFIG_COMMAND + bits::CONFIG_ITEM + bits::CONFIG_VALUE,
            HostMessage::ConfigRequest { .. } => {
                bits::CONFIG_COMMAND + bits::CONFIG_VALUE + bits::CONFIG_ITEM
            }
            HostMessage::FactorySyncRequest | HostMessage::UserSyncRequest => bits::CONFIG_COMMAND,
            HostMessage::DeviceCommand(_) => bits::DEVICE_COMMAND,
            HostMessage::FactoryReset | HostMessage::BlockReset => 0,
            HostMessage::SetName(name) => bits::STRING_LENGTH + name.len() * bits::STRING_CHAR,
            HostMessage::ProgramEvent(_) => bits::PROGRAM_EVENT,
        };
        bits::MESSAGE_TYPE + body
    }

    fn write(&self, w: &mut BitWriter) -> Result<(), BitstreamError> {
        let config = |w: &mut BitWriter, command: ConfigCommand| {
            w.write_bits(MessageFromHost::ConfigMessage as u32, bits::MESSAGE_TYPE)?;
            w.write_bits(command as u32, bits::CONFIG_COMMAND)
        };

        match self {
            HostMessage::ConfigSet { item, value } => {
                config(w, ConfigCommand::SetConfig)?;
                w.write_bits(u32::from(*item), bits::CONFIG_ITEM)?;
                w.write_signed(*value, bits::CONFIG_VALUE)
            }
            HostMessage::ConfigRequest { item } => {
                config(w, ConfigCommand::RequestConfig)?;
                w.write_bits(0, bits::CONFIG_VALUE)?;
                w.write_bits(u32::from(*item), bits::CONFIG_ITEM)
            }
            HostMessage::FactorySyncRequest => config(w, ConfigCommand::RequestFactorySync),
            HostMessage::UserSyncRequest => config(w, ConfigCommand::RequestUserSync),
            HostMessage::DeviceCommand(command) => {
                w.write_bits(MessageFromHost::DeviceCommand as u32, bits::MESSAGE_TYPE)?;
                w.write_bits(*command as u32, bits::DEVICE_COMMAND)
            }
            HostMessage::FactoryReset => {
                w.write_bits(MessageFromHost::FactoryReset as u32, bits::MESSAGE_TYPE)
            }
            HostMessage::BlockReset => w.write_bits(MessageFromHost::BlockReset as u32, bits::MESSAGE_TYPE),
            HostMessage::SetName(name) => {
                w.write_bits(MessageFromHost::SetName as u32, bits::MESSAGE_TYPE)?;
                write_string(w, name)
            }
            HostMessage::ProgramEvent(data) => {
                w.write_bits(MessageFromHost::ProgramEvent as u32, bits::MESSAGE_TYPE)?;
                for value in data {
                    w.write_signed(*value, bits::PROGRAM_INT)?;
                }
                Ok(())
            }
        }
    }
}

fn write_string(w: &mut BitWriter, text: &str) -> Result<(), BitstreamError> {
    w.write_bits(text.len() as u32, bits::STRING_LENGTH)?;
    for b in text.bytes() {
        w.write_bits(u32::from(b), bits::STRING_CHAR)?;
    }
    Ok(())
}

fn check_string(text: &str, max: usize) -> Result<(), BuildError> {
    if !text.is_ascii() {
        return Err(BuildError::NotAscii);
    }
    if text.len() > max {
        return Err(BuildError::StringTooLong {
            length: text.len(),
            max,
        });
    }
    Ok(())
}

/// Wrap a payload into a sysex frame addressed to `index`
fn frame(index: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SYSEX_HEADER.len() + payload.len() + 3);
    out.extend_from_slice(&SYSEX_HEADER);
    out.push(index);
    out.extend_from_slice(payload);
    out.push(checksum(payload));
    out.push(SYSEX_FOOTER);
    out
}

/// Builds one packet of host commands addressed to a block
#[derive(Debug, Clone)]
pub struct HostPacketBuilder {
    index: u8,
    writer: BitWriter,
    messages: usize,
}

impl HostPacketBuilder {
    pub fn new(index: u8) -> Self {
        Self::with_capacity(index, MAX_HOST_PAYLOAD)
    }

    /// Builder limited to `max_payload` 7-bit bytes
    pub fn with_capacity(index: u8, max_payload: usize) -> Self {
        Self {
            index: index & TOPOLOGY_INDEX_MASK,
            writer: BitWriter::with_limit(max_payload),
            messages: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    /// Append a message. A message that does not fit is not written at all.
    pub fn add(&mut self, message: &HostMessage) -> Result<(), BuildError> {
        if let HostMessage::SetName(name) = message {
            check_string(name, MAX_NAME_LENGTH)?;
        }

        let needed = message.size_in_bits();
        if !self.writer.has_capacity(needed) {
            return Err(BuildError::Full {
                needed,
                available: self.writer.remaining_capacity().unwrap_or(0),
            });
        }

        message.write(&mut self.writer)?;
        self.messages += 1;
        Ok(())
    }

    pub fn add_config_set(&mut self, item: u8, value: i32) -> Result<(), BuildError> {
        self.add(&HostMessage::ConfigSet { item, value })
    }

    pub fn add_config_request(&mut self, item: u8) -> Result<(), BuildError> {
        self.add(&HostMessage::ConfigRequest { item })
    }

    pub fn add_factory_sync_request(&mut self) -> Result<(), BuildError> {
        self.add(&HostMessage::FactorySyncRequest)
    }

    pub fn add_user_sync_request(&mut self) -> Result<(), BuildError> {
        self.add(&HostMessage::UserSyncRequest)
    }

    pub fn add_device_command(&mut self, command: DeviceCommand) -> Result<(), BuildError> {
        self.add(&HostMessage::DeviceCommand(command))
    }

    pub fn add_factory_reset(&mut self) -> Result<(), BuildError> {
        self.add(&HostMessage::FactoryReset)
    }

    pub fn add_block_reset(&mut self) -> Result<(), BuildError> {
        self.add(&HostMessage::BlockReset)
    }

    pub fn add_set_name(&mut self, name: &str) -> Result<(), BuildError> {
        self.add(&HostMessage::SetName(name.to_string()))
    }

    pub fn add_program_event(&mut self, data: [i32; NUM_PROGRAM_MESSAGE_INTS]) -> Result<(), BuildError> {
        self.add(&HostMessage::ProgramEvent(data))
    }

    /// The complete sysex frame
    pub fn build(&self) -> Vec<u8> {
        frame(self.index, self.writer.as_bytes())
    }
}

/// Read back a frame built by [`HostPacketBuilder`]
///
/// Returns the addressed topology index and the messages in order.
pub fn parse_host_packet(data: &[u8]) -> Result<(u8, Vec<HostMessage>), DecodeError> {
    let body = data
        .strip_prefix(&SYSEX_HEADER[..])
        .and_then(|rest| rest.strip_suffix(&[SYSEX_FOOTER]))
        .ok_or(DecodeError::InvalidFrame)?;
    let (&index, payload) = body.split_first().ok_or(DecodeError::InvalidFrame)?;

    if !checksum_is_ok(payload) {
        return Err(DecodeError::Checksum);
    }

    let mut reader = BitReader::new(&payload[..payload.len() - 1]);
    let mut messages = Vec::new();

    while reader.remaining_bits() >= bits::MESSAGE_TYPE {
        let tag = reader.read_bits(bits::MESSAGE_TYPE)?;
        if tag == 0 {
            break;
        }

        let kind = MessageFromHost::try_from(tag).map_err(DecodeError::UnknownMessage)?;
        let truncated = |_| DecodeError::Truncated(tag);
        let message = match kind {
            MessageFromHost::ConfigMessage => {
                let command = reader.read_bits(bits::CONFIG_COMMAND).map_err(truncated)?;
                match ConfigCommand::try_from(command) {
                    Ok(ConfigCommand::SetConfig) => {
                        let item = reader.read_bits(bits::CONFIG_ITEM).map_err(truncated)? as u8;
                        let value = reader.read_signed(bits::CONFIG_VALUE).map_err(truncated)?;
                        HostMessage::ConfigSet { item, value }
                    }
                    Ok(ConfigCommand::RequestConfig) => {
                        reader.read_bits(bits::CONFIG_VALUE).map_err(truncated)?;
                        let item = reader.read_bits(bits::CONFIG_ITEM).map_err(truncated)? as u8;
                        HostMessage::ConfigRequest { item }
                    }
                    Ok(ConfigCommand::RequestFactorySync) => HostMessage::FactorySyncRequest,
                    Ok(ConfigCommand::RequestUserSync) => HostMessage::UserSyncRequest,
                    _ => return Err(DecodeError::UnknownMessage(tag)),
                }
            }
            MessageFromHost::DeviceCommand => {
                let raw = reader.read_bits(bits::DEVICE_COMMAND).map_err(truncated)?;
                let command = DeviceCommand::try_from(raw).map_err(|_| DecodeError::UnknownMessage(tag))?;
                HostMessage::DeviceCommand(command)
            }
            MessageFromHost::FactoryReset => HostMessage::FactoryReset,
            MessageFromHost::BlockReset => HostMessage::BlockReset,
            MessageFromHost::SetName => {
                let length = reader.read_bits(bits::STRING_LENGTH).map_err(truncated)? as usize;
                HostMessage::SetName(reader.read_string(length).map_err(truncated)?)
            }
            MessageFromHost::ProgramEvent => {
                let mut data = [0i32; NUM_PROGRAM_MESSAGE_INTS];
                for value in data.iter_mut() {
                    *value = reader.read_signed(bits::PROGRAM_INT).map_err(truncated)?;
                }
                HostMessage::ProgramEvent(data)
            }
        };
        messages.push(message);
    }

    Ok((index & TOPOLOGY_INDEX_MASK, messages))
}

/// Builds packets in the format blocks send to the host
#[derive(Debug, Clone)]
pub struct DevicePacketBuilder {
    writer: BitWriter,
}

impl DevicePacketBuilder {
    pub fn new(timestamp: u32) -> Self {
        let mut writer = BitWriter::new();
        // An unbounded writer only fails on invalid widths
        let _ = writer.write_bits(timestamp, bits::TIMESTAMP);
        Self { writer }
    }

    fn tag(&mut self, message: MessageFromDevice) -> Result<(), BuildError> {
        Ok(self.writer.write_bits(message as u32, bits::MESSAGE_TYPE)?)
    }

    /// Write an arbitrary message tag with no body
    pub fn raw_tag(&mut self, tag: u32) -> Result<(), BuildError> {
        Ok(self.writer.write_bits(tag, bits::MESSAGE_TYPE)?)
    }

    pub fn topology(
        &mut self,
        is_new: bool,
        devices: &[DeviceStatus],
        connections: &[ConnectionInfo],
    ) -> Result<(), BuildError> {
        self.topology_with_version(CURRENT_PROTOCOL_VERSION, is_new, devices, connections)
    }

    pub fn topology_with_version(
        &mut self,
        protocol_version: u32,
        is_new: bool,
        devices: &[DeviceStatus],
        connections: &[ConnectionInfo],
    ) -> Result<(), BuildError> {
        self.tag(if is_new {
            MessageFromDevice::DeviceTopology
        } else {
            MessageFromDevice::DeviceTopologyExtend
        })?;

        let w = &mut self.writer;
        w.write_bits(protocol_version, bits::PROTOCOL_VERSION)?;
        w.write_bits(devices.len() as u32, bits::DEVICE_COUNT)?;
        w.write_bits(connections.len() as u32, bits::CONNECTION_COUNT)?;

        for device in devices {
            for &c in device.serial.as_bytes() {
                w.write_bits(u32::from(c), bits::SERIAL_CHAR)?;
            }
            w.write_bits(u32::from(device.index), bits::TOPOLOGY_INDEX)?;
            w.write_bits(u32::from(device.battery_level), bits::BATTERY_LEVEL)?;
            w.write_bool(device.battery_charging)?;
        }

        for c in connections {
            w.write_bits(u32::from(c.device1), bits::TOPOLOGY_INDEX)?;
            w.write_bits(u32::from(c.port1), bits::CONNECTOR_PORT)?;
            w.write_bits(u32::from(c.device2), bits::TOPOLOGY_INDEX)?;
            w.write_bits(u32::from(c.port2), bits::CONNECTOR_PORT)?;
        }
        Ok(())
    }

    pub fn topology_end(&mut self) -> Result<(), BuildError> {
        self.tag(MessageFromDevice::DeviceTopologyEnd)?;
        Ok(self.writer.write_bits(CURRENT_PROTOCOL_VERSION, bits::PROTOCOL_VERSION)?)
    }

    pub fn version(&mut self, index: u8, version: &str) -> Result<(), BuildError> {
        check_string(version, MAX_VERSION_LENGTH)?;
        self.tag(MessageFromDevice::DeviceVersion)?;
        self.writer.write_bits(u32::from(index), bits::TOPOLOGY_INDEX)?;
        Ok(write_string(&mut self.writer, version)?)
    }

    pub fn name(&mut self, index: u8, name: &str) -> Result<(), BuildError> {
        check_string(name, MAX_NAME_LENGTH)?;
        self.tag(MessageFromDevice::DeviceName)?;
        self.writer.write_bits(u32::from(index), bits::TOPOLOGY_INDEX)?;
        Ok(write_string(&mut self.writer, name)?)
    }

    pub fn touch(
        &mut self,
        offset: u32,
        touch_index: u8,
        position: TouchPosition,
        velocity: Option<TouchVelocity>,
        is_start: bool,
        is_end: bool,
    ) -> Result<(), BuildError> {
        use MessageFromDevice::*;
        let message = match (velocity.is_some(), is_start, is_end) {
            (false, true, _) => TouchStart,
            (false, false, true) => TouchEnd,
            (false, false, false) => TouchMove,
            (true, true, _) => TouchStartWithVelocity,
            (true, false, true) => TouchEndWithVelocity,
            (true, false, false) => TouchMoveWithVelocity,
        };
        self.tag(message)?;

        let w = &mut self.writer;
        w.write_bits(offset, bits::TIMESTAMP_OFFSET)?;
        w.write_bits(u32::from(touch_index), bits::TOUCH_INDEX)?;
        w.write_bits(u32::from(position.x), bits::TOUCH_X)?;
        w.write_bits(u32::from(position.y), bits::TOUCH_Y)?;
        w.write_bits(u32::from(position.z), bits::TOUCH_Z)?;
        if let Some(v) = velocity {
            w.write_bits(u32::from(v.vx), bits::VELOCITY)?;
            w.write_bits(u32::from(v.vy), bits::VELOCITY)?;
            w.write_bits(u32::from(v.vz), bits::VELOCITY)?;
        }
        Ok(())
    }

    pub fn button(&mut self, offset: u32, button_id: u32, is_down: bool) -> Result<(), BuildError> {
        self.tag(if is_down {
            MessageFromDevice::ControlButtonDown
        } else {
            MessageFromDevice::ControlButtonUp
        })?;
        self.writer.write_bits(offset, bits::TIMESTAMP_OFFSET)?;
        Ok(self.writer.write_bits(button_id, bits::BUTTON_ID)?)
    }

    pub fn program_event(&mut self, data: [i32; NUM_PROGRAM_MESSAGE_INTS]) -> Result<(), BuildError> {
        self.tag(MessageFromDevice::ProgramEvent)?;
        for value in data {
            self.writer.write_signed(value, bits::PROGRAM_INT)?;
        }
        Ok(())
    }

    pub fn packet_ack(&mut self, counter: u32) -> Result<(), BuildError> {
        self.tag(MessageFromDevice::PacketAck)?;
        Ok(self.writer.write_bits(counter, bits::PACKET_COUNTER)?)
    }

    pub fn firmware_update_ack(&mut self, code: u8, detail: u32) -> Result<(), BuildError> {
        self.tag(MessageFromDevice::FirmwareUpdateAck)?;
        self.writer.write_bits(u32::from(code), bits::FIRMWARE_ACK_CODE)?;
        Ok(self.writer.write_bits(detail, bits::FIRMWARE_ACK_DETAIL)?)
    }

    pub fn config_update(&mut self, item: u8, value: i32, min: i32, max: i32) -> Result<(), BuildError> {
        self.config_command(ConfigCommand::UpdateConfig)?;
        self.writer.write_bits(u32::from(item), bits::CONFIG_ITEM)?;
        for v in [value, min, max] {
            self.writer.write_signed(v, bits::CONFIG_VALUE)?;
        }
        Ok(())
    }

    pub fn config_set(&mut self, item: u8, value: i32) -> Result<(), BuildError> {
        self.config_command(ConfigCommand::SetConfig)?;
        self.writer.write_bits(u32::from(item), bits::CONFIG_ITEM)?;
        Ok(self.writer.write_signed(value, bits::CONFIG_VALUE)?)
    }

    /// A config message with only its sub-command
    pub fn config_command(&mut self, command: ConfigCommand) -> Result<(), BuildError> {
        self.tag(MessageFromDevice::ConfigMessage)?;
        Ok(self.writer.write_bits(command as u32, bits::CONFIG_COMMAND)?)
    }

    pub fn log(&mut self, message: &str) -> Result<(), BuildError> {
        if !message.is_ascii() {
            return Err(BuildError::NotAscii);
        }
        self.tag(MessageFromDevice::LogMessage)?;
        for b in message.bytes() {
            self.writer.write_bits(u32::from(b), bits::STRING_CHAR)?;
        }
        Ok(())
    }

    /// Payload followed by its checksum, as handed to the decoder
    pub fn data(&self) -> Vec<u8> {
        let payload = self.writer.as_bytes();
        let mut out = payload.to_vec();
        out.push(checksum(payload));
        out
    }

    /// The complete sysex frame as sent by the block at `index`
    pub fn frame(&self, index: u8) -> Vec<u8> {
        frame(index, self.writer.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_set_round_trip() {
        let mut packet = HostPacketBuilder::new(3);
        packet.add_config_set(21, -42).unwrap();

        let (index, messages) = parse_host_packet(&packet.build()).unwrap();
        assert_eq!(index, 3);
        assert_eq!(messages, vec![HostMessage::ConfigSet { item: 21, value: -42 }]);
    }

    #[test]
    fn test_frame_layout() {
        let mut packet = HostPacketBuilder::new(0x45);
        packet.add_device_command(DeviceCommand::Ping).unwrap();
        let frame = packet.build();

        assert_eq!(&frame[..5], &SYSEX_HEADER);
        assert_eq!(frame[5], 0x05);
        assert_eq!(frame.last(), Some(&SYSEX_FOOTER));
        assert!(checksum_is_ok(&frame[6..frame.len() - 1]));
    }

    #[test]
    fn test_config_request_layout() {
        let mut packet = HostPacketBuilder::new(0);
        packet.add_config_request(0x55).unwrap();
        let frame = packet.build();
        let payload = &frame[6..frame.len() - 2];

        let mut reader = BitReader::new(payload);
        assert_eq!(reader.read_bits(7), Ok(MessageFromHost::ConfigMessage as u32));
        assert_eq!(reader.read_bits(4), Ok(ConfigCommand::RequestConfig as u32));
        assert_eq!(reader.read_bits(32), Ok(0));
        assert_eq!(reader.read_bits(8), Ok(0x55));
    }

    #[test]
    fn test_all_messages_round_trip() {
        let messages = vec![
            HostMessage::DeviceCommand(DeviceCommand::BeginApiMode),
            HostMessage::FactorySyncRequest,
            HostMessage::UserSyncRequest,
            HostMessage::ConfigRequest { item: 100 },
            HostMessage::FactoryReset,
            HostMessage::BlockReset,
            HostMessage::SetName("Pad".to_string()),
        ];

        let mut packet = HostPacketBuilder::new(1);
        for m in &messages {
            packet.add(m).unwrap();
        }
        assert_eq!(parse_host_packet(&packet.build()).unwrap().1, messages);

        let mut packet = HostPacketBuilder::new(1);
        packet.add_program_event([1, -2, i32::MAX]).unwrap();
        assert_eq!(
            parse_host_packet(&packet.build()).unwrap().1,
            vec![HostMessage::ProgramEvent([1, -2, i32::MAX])]
        );
    }

    #[test]
    fn test_capacity_leaves_packet_unchanged() {
        let mut packet = HostPacketBuilder::new(0);
        // Each config set is 7 + 4 + 8 + 32 = 51 bits of a 224 bit payload
        for _ in 0..4 {
            packet.add_config_set(1, 1).unwrap();
        }
        let before = packet.build();

        let result = packet.add_config_set(2, 2);
        assert!(matches!(result, Err(BuildError::Full { needed: 51, .. })));
        assert_eq!(packet.build(), before);
        assert_eq!(packet.message_count(), 4);

        // Smaller messages still fit
        packet.add_block_reset().unwrap();
    }

    #[test]
    fn test_name_validation() {
        let mut packet = HostPacketBuilder::new(0);
        assert_eq!(packet.add_set_name("Pädé"), Err(BuildError::NotAscii));
        assert!(matches!(
            packet.add_set_name(&"x".repeat(40)),
            Err(BuildError::StringTooLong { length: 40, max: 33 })
        ));
        assert!(packet.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert_eq!(parse_host_packet(&[0xf0, 0x01]), Err(DecodeError::InvalidFrame));

        let mut packet = HostPacketBuilder::new(0);
        packet.add_factory_reset().unwrap();
        let mut frame = packet.build();
        let checksum_at = frame.len() - 2;
        frame[checksum_at] ^= 0x01;
        assert_eq!(parse_host_packet(&frame), Err(DecodeError::Checksum));
    }
}
