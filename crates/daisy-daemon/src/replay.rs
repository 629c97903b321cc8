//! Capture replay backend
//!
//! Stands in for an OS MIDI binding. A capture file lists the frames each
//! device sends, one hex-encoded frame per line:
//!
//! ```text
//! # comment
//! device Lightpad BLOCK
//! +100 f0 00 21 10 77 00 ... f7
//! ```
//!
//! `device <name>` starts a new device. A `+<ms>` prefix delays that frame
//! relative to the previous one. Frames before the first `device` line belong
//! to a device named [`DEFAULT_DEVICE_NAME`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, trace};

use daisy_core::SerialNumber;
use daisy_discovery::{
    EndpointInfo, MidiBackend, MidiInputCallback, MidiInputPort, MidiOutputPort,
};
use daisy_protocol::{
    ConnectionInfo, DevicePacketBuilder, DeviceStatus, TouchPosition, TransportError,
};

pub const DEFAULT_DEVICE_NAME: &str = "Lightpad BLOCK";

/// Pause before the first frame so the connection can install its handler
const START_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    pub delay: Duration,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub frames: Vec<CaptureFrame>,
}

impl CaptureDevice {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: Vec::new(),
        }
    }
}

pub fn parse_capture(text: &str) -> Result<Vec<CaptureDevice>> {
    let mut devices: Vec<CaptureDevice> = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix("device ") {
            let name = name.trim();
            if name.is_empty() {
                bail!("line {}: device without a name", number + 1);
            }
            devices.push(CaptureDevice::new(name));
            continue;
        }

        let frame = parse_frame(line).with_context(|| format!("line {}", number + 1))?;
        if devices.is_empty() {
            devices.push(CaptureDevice::new(DEFAULT_DEVICE_NAME));
        }
        if let Some(device) = devices.last_mut() {
            device.frames.push(frame);
        }
    }

    Ok(devices)
}

fn parse_frame(line: &str) -> Result<CaptureFrame> {
    let (delay, rest) = match line.strip_prefix('+') {
        Some(rest) => {
            let (ms, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let ms: u64 = ms.parse().with_context(|| format!("bad delay '{ms}'"))?;
            (Duration::from_millis(ms), rest)
        }
        None => (Duration::ZERO, line),
    };

    let digits: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() {
        bail!("frame has no data");
    }
    let data = hex::decode(&digits).context("frame is not valid hex")?;

    Ok(CaptureFrame { delay, data })
}

pub fn load_capture(path: &Path) -> Result<Vec<CaptureDevice>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let devices = parse_capture(&text).with_context(|| format!("parsing {}", path.display()))?;
    if devices.is_empty() {
        bail!("{} contains no devices", path.display());
    }
    Ok(devices)
}

/// Two connected Lightpads reporting their topology, names and a short touch
pub fn demo_capture() -> Result<Vec<CaptureDevice>> {
    let devices = [
        DeviceStatus {
            serial: SerialNumber::from_str_padded("LPB8A2C4E6F10193"),
            index: 0,
            battery_level: 24,
            battery_charging: true,
        },
        DeviceStatus {
            serial: SerialNumber::from_str_padded("LPB8A2C4E6F10ABC"),
            index: 1,
            battery_level: 17,
            battery_charging: false,
        },
    ];
    let links = [ConnectionInfo {
        device1: 0,
        port1: 2,
        device2: 1,
        port2: 6,
    }];

    let mut topology = DevicePacketBuilder::new(0);
    topology.topology(true, &devices, &links)?;

    let mut info = DevicePacketBuilder::new(10);
    info.version(0, "1.1.0-g4a5b6c7")?;
    info.name(0, "Lightpad A")?;
    info.version(1, "1.1.0-g4a5b6c7")?;
    info.name(1, "Lightpad B")?;

    let mut frames = vec![
        CaptureFrame {
            delay: Duration::ZERO,
            data: topology.frame(0),
        },
        CaptureFrame {
            delay: Duration::from_millis(50),
            data: info.frame(0),
        },
    ];

    for (step, x) in [0x400u16, 0x600, 0x800].into_iter().enumerate() {
        let mut touch = DevicePacketBuilder::new(100 + step as u32 * 20);
        let position = TouchPosition { x, y: 0x800, z: 0x80 };
        touch.touch(0, 0, position, None, step == 0, step == 2)?;
        frames.push(CaptureFrame {
            delay: Duration::from_millis(200),
            data: touch.frame(0),
        });
    }

    Ok(vec![CaptureDevice {
        name: DEFAULT_DEVICE_NAME.to_string(),
        frames,
    }])
}

/// [`MidiBackend`] whose devices play back a capture each time they are opened
pub struct ReplayBackend {
    devices: Vec<CaptureDevice>,
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl ReplayBackend {
    pub fn new(devices: Vec<CaptureDevice>) -> Self {
        Self {
            devices,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn device(&self, identifier: &str) -> Result<&CaptureDevice, TransportError> {
        self.devices
            .iter()
            .enumerate()
            .find(|(index, _)| endpoint_identifier(*index) == identifier)
            .map(|(_, device)| device)
            .ok_or_else(|| TransportError::PortNotFound(identifier.to_string()))
    }

    /// Frames the host has sent so far
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().clone()
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, d)| EndpointInfo::new(d.name.clone(), endpoint_identifier(index)))
            .collect()
    }
}

// Capture devices may share a name, so endpoints are identified by position
fn endpoint_identifier(index: usize) -> String {
    format!("replay-{index}")
}

impl MidiBackend for ReplayBackend {
    fn inputs(&self) -> Vec<EndpointInfo> {
        self.endpoints()
    }

    fn outputs(&self) -> Vec<EndpointInfo> {
        self.endpoints()
    }

    fn open_input(
        &self,
        identifier: &str,
        callback: MidiInputCallback,
    ) -> Result<Box<dyn MidiInputPort>, TransportError> {
        let device = self.device(identifier)?.clone();
        let stopped = Arc::new(Mutex::new(false));
        let thread_stopped = stopped.clone();

        std::thread::Builder::new()
            .name(format!("replay {}", device.name))
            .spawn(move || play(device, callback, thread_stopped))
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        Ok(Box::new(ReplayInput { stopped }))
    }

    fn open_output(&self, identifier: &str) -> Result<Box<dyn MidiOutputPort>, TransportError> {
        let device = self.device(identifier)?;
        Ok(Box::new(ReplayOutput {
            name: device.name.clone(),
            sent: self.sent.clone(),
        }))
    }
}

fn play(device: CaptureDevice, callback: MidiInputCallback, stopped: Arc<Mutex<bool>>) {
    std::thread::sleep(START_DELAY);
    debug!(device = %device.name, frames = device.frames.len(), "Replaying capture");

    for frame in &device.frames {
        std::thread::sleep(frame.delay);
        let stopped = stopped.lock();
        if *stopped {
            return;
        }
        callback(&frame.data);
    }

    debug!(device = %device.name, "Capture finished");
}

struct ReplayInput {
    stopped: Arc<Mutex<bool>>,
}

impl MidiInputPort for ReplayInput {
    fn stop(&self) {
        *self.stopped.lock() = true;
    }
}

struct ReplayOutput {
    name: String,
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MidiOutputPort for ReplayOutput {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        trace!(device = %self.name, frame = %hex::encode(data), "Host frame");
        self.sent.lock().push((self.name.clone(), data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daisy_protocol::defs::SYSEX_HEADER;
    use std::sync::mpsc;

    #[test]
    fn test_parse_capture() {
        let text = "\
# two frames for the default device
f0 00 21 10 77 00 01 f7
+250 F0002110770102F7

device Seaboard BLOCK
+5 f0002110770203f7
";
        let devices = parse_capture(text).unwrap();
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].name, DEFAULT_DEVICE_NAME);
        assert_eq!(devices[0].frames.len(), 2);
        assert_eq!(devices[0].frames[0].delay, Duration::ZERO);
        assert_eq!(
            devices[0].frames[0].data,
            vec![0xf0, 0x00, 0x21, 0x10, 0x77, 0x00, 0x01, 0xf7]
        );
        assert_eq!(devices[0].frames[1].delay, Duration::from_millis(250));

        assert_eq!(devices[1].name, "Seaboard BLOCK");
        assert_eq!(devices[1].frames[0].delay, Duration::from_millis(5));
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let err = parse_capture("f0 00\nnot hex\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        assert!(parse_capture("+abc f0\n").is_err());
        assert!(parse_capture("+10\n").is_err());
        assert!(parse_capture("device \n").is_err());
        assert!(parse_capture("f0 0\n").is_err());
    }

    #[test]
    fn test_load_capture_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "# nothing here\n").unwrap();
        assert!(load_capture(file.path()).is_err());
    }

    #[test]
    fn test_demo_capture_is_framed() {
        let devices = demo_capture().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(daisy_discovery::is_blocks_device_name(&devices[0].name));
        for frame in &devices[0].frames {
            assert!(frame.data.starts_with(&SYSEX_HEADER));
            assert_eq!(frame.data.last(), Some(&0xf7));
        }
    }

    #[test]
    fn test_open_replays_frames() {
        let devices = parse_capture("device Lightpad BLOCK\nf0 01 f7\n+1 f0 02 f7\n").unwrap();
        let backend = ReplayBackend::new(devices);
        assert_eq!(backend.inputs(), backend.outputs());

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let input = backend
            .open_input(
                "replay-0",
                Box::new(move |frame| {
                    let _ = tx.lock().send(frame.to_vec());
                }),
            )
            .unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), vec![0xf0, 0x01, 0xf7]);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), vec![0xf0, 0x02, 0xf7]);
        input.stop();
    }

    #[test]
    fn test_stop_before_start_delivers_nothing() {
        let backend = ReplayBackend::new(parse_capture("f0 01 f7\n").unwrap());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let input = backend
            .open_input(
                "replay-0",
                Box::new(move |frame| {
                    let _ = tx.lock().send(frame.to_vec());
                }),
            )
            .unwrap();
        input.stop();
        assert!(rx.recv_timeout(START_DELAY * 3).is_err());
    }

    #[test]
    fn test_output_records_frames() {
        let backend = ReplayBackend::new(parse_capture("f0 01 f7\n").unwrap());
        let output = backend.open_output("replay-0").unwrap();
        output.send(&[0xf0, 0x00, 0xf7]).unwrap();
        assert_eq!(
            backend.sent(),
            vec![(DEFAULT_DEVICE_NAME.to_string(), vec![0xf0, 0x00, 0xf7])]
        );

        assert!(matches!(
            backend.open_output("replay-1"),
            Err(TransportError::PortNotFound(_))
        ));
    }
}
