//! Serial number probing
//!
//! Before a block has reported its topology the host does not know which block
//! sits at the end of the cable. The prober repeatedly sends an identity dump
//! request and extracts the serial number from the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use daisy_core::{ListenerId, SerialNumber, SERIAL_LENGTH};
use daisy_protocol::defs::{SERIAL_DUMP_REQUEST, SERIAL_DUMP_RESPONSE_HEADER};
use daisy_protocol::{ConnectionListener, DeviceConnection};

pub const INITIAL_DELAY: Duration = Duration::from_millis(10);
pub const REQUEST_INTERVAL: Duration = Duration::from_millis(300);

const SERIAL_MARKER: &[u8] = b"48:B6:20:";
const SERIAL_OFFSET: usize = 17;

/// Extract the serial number from an identity dump response
pub fn parse_serial_response(frame: &[u8]) -> Option<SerialNumber> {
    if !frame.starts_with(&SERIAL_DUMP_RESPONSE_HEADER) {
        return None;
    }

    let marker = frame
        .windows(SERIAL_MARKER.len())
        .position(|w| w == SERIAL_MARKER)?;

    let start = marker + SERIAL_OFFSET;
    let bytes: [u8; SERIAL_LENGTH] = frame.get(start..start + SERIAL_LENGTH)?.try_into().ok()?;
    Some(SerialNumber::from_bytes(bytes))
}

#[derive(Default)]
struct ProbeState {
    serial: Mutex<Option<SerialNumber>>,
    deleted: AtomicBool,
}

impl ConnectionListener for ProbeState {
    fn frame_received(&self, frame: &[u8]) {
        let mut serial = self.serial.lock();
        if serial.is_some() {
            return;
        }
        if let Some(found) = parse_serial_response(frame) {
            *serial = Some(found);
        }
    }

    fn connection_being_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }
}

/// Asks the block at the end of `connection` for its serial number
pub struct SerialReader {
    connection: Arc<dyn DeviceConnection>,
    state: Arc<ProbeState>,
    listener: Option<ListenerId>,
    next_request: Option<Instant>,
}

impl SerialReader {
    pub fn new(connection: Arc<dyn DeviceConnection>, now: Instant) -> Self {
        let state = Arc::new(ProbeState::default());
        let as_listener: Arc<dyn ConnectionListener> = state.clone();

        let listener = connection.add_listener(&as_listener);
        let next_request = match listener {
            Some(_) => Some(now + INITIAL_DELAY),
            None => {
                debug!(device = %connection.name(), "Connection has no raw frames, serial probe disabled");
                None
            }
        };

        Self {
            connection,
            state,
            listener,
            next_request,
        }
    }

    pub fn serial(&self) -> Option<SerialNumber> {
        *self.state.serial.lock()
    }

    pub fn has_serial(&self) -> bool {
        self.serial().is_some()
    }

    /// True while requests are still being sent
    pub fn is_probing(&self) -> bool {
        self.next_request.is_some()
    }

    /// Send a request if one is due
    pub fn tick(&mut self, now: Instant) {
        let Some(due) = self.next_request else {
            return;
        };

        if self.state.deleted.load(Ordering::Relaxed) {
            self.next_request = None;
            return;
        }

        if let Some(serial) = self.serial() {
            info!(device = %self.connection.name(), %serial, "Read master serial number");
            self.next_request = None;
            return;
        }

        if now >= due {
            self.connection.send(&SERIAL_DUMP_REQUEST);
            self.next_request = Some(now + REQUEST_INTERVAL);
        }
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.connection.remove_listener(id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use daisy_core::ListenerRegistry;
    use daisy_protocol::MessageHandler;

    /// Build an identity dump response carrying `serial`
    pub(crate) fn serial_response(serial: &str) -> Vec<u8> {
        let mut frame = SERIAL_DUMP_RESPONSE_HEADER.to_vec();
        frame.extend_from_slice(&[0x01, 0x02, 0x03]);
        frame.extend_from_slice(SERIAL_MARKER);
        frame.extend_from_slice(b"00:00:00");
        frame.extend_from_slice(serial.as_bytes());
        frame.push(0xf7);
        frame
    }

    #[derive(Default)]
    struct Loopback {
        sent: Mutex<Vec<Vec<u8>>>,
        listeners: Mutex<ListenerRegistry<dyn ConnectionListener>>,
    }

    impl Loopback {
        fn receive(&self, frame: &[u8]) {
            self.listeners.lock().for_each(|l| l.frame_received(frame));
        }

        fn tear_down(&self) {
            self.listeners.lock().for_each(|l| l.connection_being_deleted());
        }
    }

    impl DeviceConnection for Loopback {
        fn send(&self, frame: &[u8]) -> bool {
            self.sent.lock().push(frame.to_vec());
            true
        }

        fn set_message_handler(&self, _handler: Option<MessageHandler>) {}

        fn add_listener(&self, listener: &Arc<dyn ConnectionListener>) -> Option<ListenerId> {
            Some(self.listeners.lock().add(listener))
        }

        fn remove_listener(&self, id: ListenerId) {
            self.listeners.lock().remove(id);
        }

        fn name(&self) -> String {
            "loopback".to_string()
        }
    }

    #[test]
    fn test_parse_response() {
        let frame = serial_response("LPB1234567890ABC");
        let serial = parse_serial_response(&frame).unwrap();
        assert_eq!(serial.to_string(), "LPB1234567890ABC");
    }

    #[test]
    fn test_parse_rejects_short_or_foreign_frames() {
        let mut short = serial_response("LPB1234567890ABC");
        short.truncate(short.len() - 3);
        assert!(parse_serial_response(&short).is_none());

        let mut foreign = serial_response("LPB1234567890ABC");
        foreign[4] = 0x77;
        assert!(parse_serial_response(&foreign).is_none());

        assert!(parse_serial_response(&SERIAL_DUMP_RESPONSE_HEADER).is_none());
    }

    #[test]
    fn test_request_schedule() {
        let connection = Arc::new(Loopback::default());
        let start = Instant::now();
        let mut reader = SerialReader::new(connection.clone(), start);

        reader.tick(start);
        assert!(connection.sent.lock().is_empty());

        reader.tick(start + Duration::from_millis(10));
        assert_eq!(connection.sent.lock().len(), 1);
        assert_eq!(connection.sent.lock()[0], SERIAL_DUMP_REQUEST.to_vec());

        reader.tick(start + Duration::from_millis(200));
        assert_eq!(connection.sent.lock().len(), 1);
        reader.tick(start + Duration::from_millis(310));
        assert_eq!(connection.sent.lock().len(), 2);

        connection.receive(&serial_response("LPB1234567890ABC"));
        assert_eq!(reader.serial().unwrap().to_string(), "LPB1234567890ABC");

        reader.tick(start + Duration::from_secs(5));
        assert!(!reader.is_probing());
        assert_eq!(connection.sent.lock().len(), 2);
    }

    #[test]
    fn test_teardown_stops_probe() {
        let connection = Arc::new(Loopback::default());
        let start = Instant::now();
        let mut reader = SerialReader::new(connection.clone(), start);

        connection.tear_down();
        reader.tick(start + Duration::from_secs(1));
        assert!(!reader.is_probing());
        assert!(connection.sent.lock().is_empty());
    }

    #[test]
    fn test_drop_unregisters() {
        let connection = Arc::new(Loopback::default());
        let reader = SerialReader::new(connection.clone(), Instant::now());
        assert_eq!(connection.listeners.lock().len(), 1);
        drop(reader);
        assert!(connection.listeners.lock().is_empty());
    }
}
