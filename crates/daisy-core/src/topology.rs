//! Topology snapshot: the set of known blocks and the port-to-port links between them

use serde::{Deserialize, Serialize};

use crate::device::{Block, ConnectionPort, Uid};

/// A physical link between two blocks
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockConnection {
    pub device1: Uid,
    pub port1: ConnectionPort,
    pub device2: Uid,
    pub port2: ConnectionPort,
}

impl BlockConnection {
    pub fn new(device1: Uid, port1: ConnectionPort, device2: Uid, port2: ConnectionPort) -> Self {
        Self {
            device1,
            port1,
            device2,
            port2,
        }
    }

    /// Whether this connection touches the given block
    pub fn involves(&self, uid: Uid) -> bool {
        self.device1 == uid || self.device2 == uid
    }

    /// The block on the other side of the link, if `uid` is one end of it
    pub fn other_end(&self, uid: Uid) -> Option<Uid> {
        if self.device1 == uid {
            Some(self.device2)
        } else if self.device2 == uid {
            Some(self.device1)
        } else {
            None
        }
    }
}

// Links have no direction
impl PartialEq for BlockConnection {
    fn eq(&self, other: &Self) -> bool {
        let same = self.device1 == other.device1
            && self.port1 == other.port1
            && self.device2 == other.device2
            && self.port2 == other.port2;
        let swapped = self.device1 == other.device2
            && self.port1 == other.port2
            && self.device2 == other.device1
            && self.port2 == other.port1;
        same || swapped
    }
}

impl Eq for BlockConnection {}

/// Snapshot of all known blocks and their connections
///
/// Snapshots are replaced wholesale whenever a topology resync completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockTopology {
    pub blocks: Vec<Block>,
    pub connections: Vec<BlockConnection>,
}

impl BlockTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Add a block, replacing any existing block with the same UID
    pub fn add_block(&mut self, block: Block) {
        match self.blocks.iter_mut().find(|b| b.uid == block.uid) {
            Some(existing) => *existing = block,
            None => self.blocks.push(block),
        }
    }

    /// Add a connection unless an equal one is already present
    pub fn add_connection(&mut self, connection: BlockConnection) {
        if !self.connections.contains(&connection) {
            self.connections.push(connection);
        }
    }

    pub fn block_with_uid(&self, uid: Uid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.uid == uid)
    }

    pub fn block_with_uid_mut(&mut self, uid: Uid) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.uid == uid)
    }

    /// Blocks that share at least one connection with `uid`
    pub fn directly_connected(&self, uid: Uid) -> Vec<&Block> {
        let mut neighbours: Vec<Uid> = Vec::new();
        for other in self.connections.iter().filter_map(|c| c.other_end(uid)) {
            if !neighbours.contains(&other) {
                neighbours.push(other);
            }
        }

        neighbours
            .into_iter()
            .filter_map(|n| self.block_with_uid(n))
            .collect()
    }

    pub fn connections_between(&self, a: Uid, b: Uid) -> Vec<&BlockConnection> {
        self.connections
            .iter()
            .filter(|c| c.other_end(a) == Some(b))
            .collect()
    }

    pub fn connection_count(&self, uid: Uid) -> usize {
        self.connections.iter().filter(|c| c.involves(uid)).count()
    }

    pub fn masters(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_master)
    }

    /// Drop a block and every connection touching it
    pub fn remove_block(&mut self, uid: Uid) {
        self.blocks.retain(|b| b.uid != uid);
        self.connections.retain(|c| !c.involves(uid));
    }
}

// Order-insensitive comparison of both sets
impl PartialEq for BlockTopology {
    fn eq(&self, other: &Self) -> bool {
        self.blocks.len() == other.blocks.len()
            && self.connections.len() == other.connections.len()
            && self.blocks.iter().all(|b| other.blocks.contains(b))
            && self.connections.iter().all(|c| other.connections.contains(c))
    }
}
