//! Duplex connection to one master block over a MIDI endpoint pair

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use daisy_core::{ListenerId, ListenerRegistry};
use daisy_protocol::defs::{SYSEX_FOOTER, SYSEX_HEADER};
use daisy_protocol::{ConnectionListener, DeviceConnection, MessageHandler, TransportError};

use crate::lock::PortLock;
use crate::midi::{EndpointPair, MidiBackend, MidiInputPort, MidiOutputPort};

#[derive(Default)]
struct Inbound {
    handler: Option<MessageHandler>,
    listeners: ListenerRegistry<dyn ConnectionListener>,
}

/// Runs on the backend's I/O thread. Never waits: a frame arriving while the
/// inbound state is busy is dropped.
fn deliver(inbound: &Mutex<Inbound>, frame: &[u8]) {
    let Some(mut inbound) = inbound.try_lock() else {
        trace!(len = frame.len(), "Connection busy, dropping inbound frame");
        return;
    };

    if frame.len() > SYSEX_HEADER.len() + 1 && frame.starts_with(&SYSEX_HEADER) {
        if let Some(handler) = &inbound.handler {
            handler(&frame[SYSEX_HEADER.len()..frame.len() - 1]);
        }
    }

    inbound.listeners.for_each(|l| l.frame_received(frame));
}

/// Frames must look like sysex from this vendor. The last header byte differs
/// between packet kinds so it is not checked.
fn is_valid_outbound(frame: &[u8]) -> bool {
    let prefix = &SYSEX_HEADER[..SYSEX_HEADER.len() - 1];
    frame.len() > SYSEX_HEADER.len() && frame.starts_with(prefix) && frame.last() == Some(&SYSEX_FOOTER)
}

pub struct MidiDeviceConnection {
    name: String,
    inbound: Arc<Mutex<Inbound>>,
    input: Mutex<Option<Box<dyn MidiInputPort>>>,
    output: Option<Box<dyn MidiOutputPort>>,
    _lock: Arc<PortLock>,
}

impl MidiDeviceConnection {
    /// Open both endpoints of `pair`. The lock is held for the lifetime of
    /// the connection.
    pub fn open(
        backend: &dyn MidiBackend,
        pair: &EndpointPair,
        lock: Arc<PortLock>,
    ) -> Result<Self, TransportError> {
        let inbound = Arc::new(Mutex::new(Inbound::default()));

        let output = match &pair.output {
            Some(output) => Some(backend.open_output(&output.identifier)?),
            None => None,
        };

        let callback_state = inbound.clone();
        let input = backend.open_input(
            &pair.input.identifier,
            Box::new(move |frame| deliver(&callback_state, frame)),
        )?;

        debug!(
            input = %pair.input.name,
            has_output = output.is_some(),
            "Device connection open"
        );

        Ok(Self {
            name: pair.input.name.clone(),
            inbound,
            input: Mutex::new(Some(input)),
            output,
            _lock: lock,
        })
    }

    fn try_send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !is_valid_outbound(frame) {
            return Err(TransportError::MalformedFrame(frame.len()));
        }
        let output = self.output.as_ref().ok_or(TransportError::NoOutput)?;
        output.send(frame)
    }
}

impl DeviceConnection for MidiDeviceConnection {
    fn send(&self, frame: &[u8]) -> bool {
        match self.try_send(frame) {
            Ok(()) => true,
            Err(TransportError::MalformedFrame(len)) => {
                debug!(device = %self.name, len, "Refusing to send malformed frame");
                false
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "Send failed");
                false
            }
        }
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        self.inbound.lock().handler = handler;
    }

    fn add_listener(&self, listener: &Arc<dyn ConnectionListener>) -> Option<ListenerId> {
        Some(self.inbound.lock().listeners.add(listener))
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inbound.lock().listeners.remove(id);
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Drop for MidiDeviceConnection {
    fn drop(&mut self) {
        {
            let mut inbound = self.inbound.lock();
            inbound.listeners.for_each(|l| l.connection_being_deleted());
            inbound.listeners.clear();
            inbound.handler = None;
        }

        if let Some(input) = self.input.lock().take() {
            input.stop();
        }

        debug!(device = %self.name, "Device connection closed");
    }
}
