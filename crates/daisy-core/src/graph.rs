//! Traversal paths through a topology, one per master block

use std::collections::HashSet;
use std::fmt;

use crate::device::{Block, Uid};
use crate::topology::BlockTopology;

/// Predicate deciding whether a block takes part in traversal
pub type BlockFilter = Box<dyn Fn(&Block) -> bool + Send + Sync>;

/// Ordered depth-first paths through a topology, starting at each master
pub struct BlockGraph {
    topology: BlockTopology,
    filter: Option<BlockFilter>,
    paths: Vec<Vec<Block>>,
}

impl BlockGraph {
    pub fn new(topology: BlockTopology) -> Self {
        Self::build(topology, None)
    }

    /// Build with a filter. Rejected blocks are never entered, so anything only
    /// reachable through them is left out as well.
    pub fn with_filter(topology: BlockTopology, filter: impl Fn(&Block) -> bool + Send + Sync + 'static) -> Self {
        Self::build(topology, Some(Box::new(filter)))
    }

    fn build(topology: BlockTopology, filter: Option<BlockFilter>) -> Self {
        let mut graph = Self {
            topology,
            filter,
            paths: Vec::new(),
        };

        let paths = graph
            .topology
            .masters()
            .filter(|m| graph.includes(m))
            .map(|m| graph.path_from(m.uid))
            .collect();
        graph.paths = paths;
        graph
    }

    fn includes(&self, block: &Block) -> bool {
        self.filter.as_ref().map_or(true, |f| f(block))
    }

    fn neighbours(&self, uid: Uid) -> Vec<Uid> {
        // Reversed so that popping yields them in connection order
        self.topology
            .directly_connected(uid)
            .into_iter()
            .rev()
            .map(|b| b.uid)
            .collect()
    }

    fn path_from(&self, master: Uid) -> Vec<Block> {
        let mut visited: HashSet<Uid> = HashSet::new();
        let mut path = Vec::new();
        let mut stack: Vec<Vec<Uid>> = Vec::new();

        if let Some(block) = self.topology.block_with_uid(master) {
            visited.insert(master);
            path.push(block.clone());
            stack.push(self.neighbours(master));
        }

        while let Some(frame) = stack.last_mut() {
            let Some(candidate) = frame.pop() else {
                stack.pop();
                continue;
            };

            if visited.contains(&candidate) {
                continue;
            }

            match self.topology.block_with_uid(candidate) {
                Some(block) if self.includes(block) => {
                    visited.insert(candidate);
                    path.push(block.clone());
                    stack.push(self.neighbours(candidate));
                }
                _ => {}
            }
        }

        path
    }

    pub fn traversal_paths(&self) -> &[Vec<Block>] {
        &self.paths
    }

    /// The path beginning at the given master, or an empty slice
    pub fn path_from_master(&self, master: Uid) -> &[Block] {
        self.paths
            .iter()
            .find(|p| p.first().is_some_and(|b| b.uid == master))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn topology(&self) -> &BlockTopology {
        &self.topology
    }
}

impl fmt::Display for BlockGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Traversal Path(s):")?;
        for path in &self.paths {
            write!(f, "\n[master]-->")?;
            for block in path {
                write!(f, "{}-->", block.serial)?;
            }
            write!(f, "[last]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGraph")
            .field("paths", &self.paths.len())
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockType, ConnectionPort, DeviceEdge, SerialNumber};
    use crate::topology::BlockConnection;

    fn chain() -> (BlockTopology, Vec<Uid>) {
        let serials = [
            "LPBAAAAAAAAAAAAA",
            "LPBBBBBBBBBBBBBB",
            "LKBCCCCCCCCCCCCC",
            "LPBDDDDDDDDDDDDD",
        ];
        let master = SerialNumber::from_str_padded(serials[0]).uid();

        let mut topology = BlockTopology::new();
        let mut uids = Vec::new();
        for (i, s) in serials.iter().enumerate() {
            let block = Block::new(SerialNumber::from_str_padded(s), i as u8, master);
            uids.push(block.uid);
            topology.add_block(block);
        }

        let east = ConnectionPort::new(DeviceEdge::East, 0);
        let west = ConnectionPort::new(DeviceEdge::West, 0);
        for pair in uids.windows(2) {
            topology.add_connection(BlockConnection::new(pair[0], east, pair[1], west));
        }
        (topology, uids)
    }

    #[test]
    fn test_chain_traversal() {
        let (topology, uids) = chain();
        let graph = BlockGraph::new(topology);

        assert_eq!(graph.traversal_paths().len(), 1);
        let path: Vec<Uid> = graph.path_from_master(uids[0]).iter().map(|b| b.uid).collect();
        assert_eq!(path, uids);
    }

    #[test]
    fn test_filter_cuts_subtree() {
        let (topology, uids) = chain();
        let graph = BlockGraph::with_filter(topology, |b| b.block_type != BlockType::Live);

        let path: Vec<Uid> = graph.path_from_master(uids[0]).iter().map(|b| b.uid).collect();
        assert_eq!(path, vec![uids[0], uids[1]]);
    }

    #[test]
    fn test_cycle_visits_each_block_once() {
        let (mut topology, uids) = chain();
        topology.add_connection(BlockConnection::new(
            uids[3],
            ConnectionPort::new(DeviceEdge::South, 0),
            uids[0],
            ConnectionPort::new(DeviceEdge::North, 0),
        ));
        let graph = BlockGraph::new(topology);

        let path = graph.path_from_master(uids[0]);
        assert_eq!(path.len(), 4);
        // Depth first: the master's first neighbour is B, so B's branch comes before D
        assert_eq!(path[1].uid, uids[1]);
    }

    #[test]
    fn test_unknown_master_has_empty_path() {
        let (topology, uids) = chain();
        let graph = BlockGraph::new(topology);
        assert!(graph.path_from_master(uids[2]).is_empty());
    }

    #[test]
    fn test_display() {
        let (topology, _) = chain();
        let graph = BlockGraph::new(topology);
        assert_eq!(
            graph.to_string(),
            "Traversal Path(s):\n[master]-->LPBAAAAAAAAAAAAA-->LPBBBBBBBBBBBBBB-->LKBCCCCCCCCCCCCC-->LPBDDDDDDDDDDDDD-->[last]"
        );
    }
}
