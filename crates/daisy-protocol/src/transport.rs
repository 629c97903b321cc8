//! Transport abstractions for talking to a chain of blocks
//!
//! A [`DeviceConnection`] is one duplex byte-message channel to a master block.
//! A [`DeviceDetector`] enumerates the connections that could be opened.

use std::sync::Arc;
use thiserror::Error;

use daisy_core::ListenerId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Frame is not a protocol packet ({0} bytes)")]
    MalformedFrame(usize),

    #[error("Connection has no output port")]
    NoOutput,

    #[error("Connection closed")]
    Closed,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Receives header-stripped packet bodies: index byte, payload and checksum
pub type MessageHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Observer of every raw frame arriving on a connection
pub trait ConnectionListener: Send + Sync {
    fn frame_received(&self, frame: &[u8]);

    /// Called while the connection is being torn down
    fn connection_being_deleted(&self) {}
}

pub trait DeviceConnection: Send + Sync {
    /// Send one complete sysex frame. Returns false if it could not be sent.
    fn send(&self, frame: &[u8]) -> bool;

    /// Install or clear the handler for inbound packet bodies
    fn set_message_handler(&self, handler: Option<MessageHandler>);

    /// Register a raw frame listener, or `None` if the transport has no raw frames
    fn add_listener(&self, _listener: &Arc<dyn ConnectionListener>) -> Option<ListenerId> {
        None
    }

    fn remove_listener(&self, _id: ListenerId) {}

    /// Human readable name of the underlying port
    fn name(&self) -> String;
}

pub trait DeviceDetector: Send + Sync {
    /// Names of the devices that can currently be opened, in index order
    fn scan(&self) -> Vec<String>;

    /// Open the device at `index` of the last scan
    fn open(&self, index: usize) -> Option<Arc<dyn DeviceConnection>>;

    /// True if a device was found but another process holds it
    fn is_locked_from_outside(&self) -> bool {
        false
    }
}
