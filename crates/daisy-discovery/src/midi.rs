//! Named-endpoint discovery over a MIDI-style backend
//!
//! Blocks show up as an input and an output endpoint with matching names. The
//! detector pairs them, guards each pair with an interprocess lock and opens a
//! [`MidiDeviceConnection`] for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use daisy_protocol::{DeviceConnection, DeviceDetector, TransportError};

use crate::connection::MidiDeviceConnection;
use crate::lock::{lock_id, LockError, PortLockRegistry};

/// One endpoint as enumerated by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub name: String,
    /// Backend specific handle used to open the endpoint
    pub identifier: String,
}

impl EndpointInfo {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
        }
    }
}

/// Called on the backend's I/O thread with each complete inbound message
pub type MidiInputCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

pub trait MidiInputPort: Send + Sync {
    /// Stop delivering messages. No callback runs after this returns.
    fn stop(&self);
}

pub trait MidiOutputPort: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;
}

/// The OS binding seam
pub trait MidiBackend: Send + Sync {
    fn inputs(&self) -> Vec<EndpointInfo>;
    fn outputs(&self) -> Vec<EndpointInfo>;

    fn open_input(
        &self,
        identifier: &str,
        callback: MidiInputCallback,
    ) -> Result<Box<dyn MidiInputPort>, TransportError>;

    fn open_output(&self, identifier: &str) -> Result<Box<dyn MidiOutputPort>, TransportError>;
}

/// Whether an endpoint name belongs to a block
pub fn is_blocks_device_name(name: &str) -> bool {
    [" BLOCK", " Block"]
        .iter()
        .any(|pattern| name.find(pattern).is_some_and(|pos| pos > 0))
}

/// Strip the direction or port-number decoration that differs between the
/// input and output names of the same device
pub fn clean_device_name(name: &str) -> String {
    let name = name.trim();

    if let Some(stripped) = name.strip_suffix(" IN)") {
        return stripped.to_string();
    }
    if let Some(stripped) = name.strip_suffix(" OUT)") {
        return stripped.to_string();
    }

    if name.ends_with(']') {
        if let Some(open) = name.rfind('[') {
            return name[..open].to_string();
        }
    }

    name.to_string()
}

/// A block input with the output it was paired with, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPair {
    pub input: EndpointInfo,
    pub output: Option<EndpointInfo>,
}

impl EndpointPair {
    /// Identifier string reported by a scan
    pub fn describe(&self) -> String {
        format!(
            "{} & {}",
            self.input.identifier,
            self.output.as_ref().map_or("", |o| o.identifier.as_str())
        )
    }

    pub fn lock_id(&self) -> String {
        lock_id(
            &self.input.name,
            self.output.as_ref().map_or("", |o| o.name.as_str()),
        )
    }
}

/// Pair every block input with an output of the same cleaned name
///
/// Several identical devices share a cleaned name, so the n-th input with a
/// given name is paired with the n-th output carrying that name.
pub fn find_pairs(inputs: &[EndpointInfo], outputs: &[EndpointInfo]) -> Vec<EndpointPair> {
    let mut pairs: Vec<EndpointPair> = Vec::new();

    for input in inputs.iter().filter(|i| is_blocks_device_name(&i.name)) {
        let cleaned = clean_device_name(&input.name);
        let ordinal = pairs
            .iter()
            .filter(|p| clean_device_name(&p.input.name) == cleaned)
            .count();

        let output = outputs
            .iter()
            .filter(|o| clean_device_name(&o.name) == cleaned)
            .nth(ordinal)
            .cloned();

        if output.is_none() {
            debug!(input = %input.name, "No matching output endpoint");
        }

        pairs.push(EndpointPair {
            input: input.clone(),
            output,
        });
    }

    pairs
}

/// [`DeviceDetector`] over a [`MidiBackend`]
pub struct MidiDeviceDetector {
    backend: Arc<dyn MidiBackend>,
    locks: PortLockRegistry,
    locked_from_outside: AtomicBool,
}

impl MidiDeviceDetector {
    pub fn new(backend: Arc<dyn MidiBackend>, locks: PortLockRegistry) -> Self {
        Self {
            backend,
            locks,
            locked_from_outside: AtomicBool::new(false),
        }
    }

    pub fn pairs(&self) -> Vec<EndpointPair> {
        find_pairs(&self.backend.inputs(), &self.backend.outputs())
    }

    pub fn locks(&self) -> &PortLockRegistry {
        &self.locks
    }
}

impl DeviceDetector for MidiDeviceDetector {
    fn scan(&self) -> Vec<String> {
        self.pairs().iter().map(EndpointPair::describe).collect()
    }

    fn open(&self, index: usize) -> Option<Arc<dyn DeviceConnection>> {
        let pair = self.pairs().into_iter().nth(index)?;

        let lock = match self.locks.acquire(&pair.lock_id()) {
            Ok(lock) => lock,
            Err(LockError::Contended(id)) => {
                info!(lock = %id, device = %pair.input.name, "Device is in use by another process");
                self.locked_from_outside.store(true, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(device = %pair.input.name, error = %e, "Failed to lock device");
                return None;
            }
        };
        self.locked_from_outside.store(false, Ordering::Relaxed);

        match MidiDeviceConnection::open(self.backend.as_ref(), &pair, lock) {
            Ok(connection) => {
                info!(device = %pair.input.name, "Opened device connection");
                Some(Arc::new(connection))
            }
            Err(e) => {
                warn!(device = %pair.input.name, error = %e, "Failed to open device");
                None
            }
        }
    }

    fn is_locked_from_outside(&self) -> bool {
        self.locked_from_outside.load(Ordering::Relaxed) && !self.pairs().is_empty()
    }
}
