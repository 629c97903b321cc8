//! Rendering of topology events for the terminal

use daisy_core::{Block, BlockTopology};
use daisy_discovery::TopologyEvent;
use serde_json::json;

#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    pub json: bool,
    pub show_input: bool,
}

impl Reporter {
    /// Text to print for an event, if any
    pub fn render(&self, event: &TopologyEvent) -> Option<String> {
        if self.json {
            self.render_json(event)
        } else {
            self.render_text(event)
        }
    }

    fn render_text(&self, event: &TopologyEvent) -> Option<String> {
        match event {
            TopologyEvent::TopologyChanged(topology) => Some(describe_topology(topology)),
            TopologyEvent::BlockAdded(block) => Some(format!("+ {}", describe_block(block))),
            TopologyEvent::BlockRemoved(block) => Some(format!("- {}", describe_block(block))),
            TopologyEvent::BlockUpdated(block) => Some(format!("~ {}", describe_block(block))),
            TopologyEvent::Log { uid, message } => Some(format!("[{uid}] {message}")),
            TopologyEvent::Touch { uid, touch } if self.show_input => Some(format!(
                "[{uid}] touch {} x={} y={} z={}{}{}",
                touch.touch_index,
                touch.position.x,
                touch.position.y,
                touch.position.z,
                if touch.is_start { " start" } else { "" },
                if touch.is_end { " end" } else { "" },
            )),
            TopologyEvent::Button {
                uid,
                button_id,
                is_down,
                ..
            } if self.show_input => Some(format!(
                "[{uid}] button {button_id} {}",
                if *is_down { "down" } else { "up" }
            )),
            TopologyEvent::Program { uid, data, .. } if self.show_input => {
                Some(format!("[{uid}] program {data:?}"))
            }
            TopologyEvent::FirmwareUpdateAck { uid, code, detail } => {
                Some(format!("[{uid}] firmware ack code={code} detail={detail}"))
            }
            _ => None,
        }
    }

    fn render_json(&self, event: &TopologyEvent) -> Option<String> {
        let value = match event {
            TopologyEvent::TopologyChanged(topology) => {
                json!({ "event": "topology", "topology": topology })
            }
            TopologyEvent::BlockAdded(block) => json!({ "event": "block_added", "block": block }),
            TopologyEvent::BlockRemoved(block) => json!({ "event": "block_removed", "block": block }),
            TopologyEvent::BlockUpdated(block) => json!({ "event": "block_updated", "block": block }),
            TopologyEvent::Log { uid, message } => {
                json!({ "event": "log", "uid": uid, "message": message })
            }
            TopologyEvent::Touch { uid, touch } if self.show_input => json!({
                "event": "touch",
                "uid": uid,
                "timestamp": touch.timestamp,
                "touch": touch.touch_index,
                "x": touch.position.x,
                "y": touch.position.y,
                "z": touch.position.z,
                "start": touch.is_start,
                "end": touch.is_end,
            }),
            TopologyEvent::Button {
                uid,
                timestamp,
                button_id,
                is_down,
            } if self.show_input => json!({
                "event": "button",
                "uid": uid,
                "timestamp": timestamp,
                "button": button_id,
                "down": is_down,
            }),
            TopologyEvent::Program { uid, timestamp, data } if self.show_input => json!({
                "event": "program",
                "uid": uid,
                "timestamp": timestamp,
                "data": data,
            }),
            _ => return None,
        };
        Some(value.to_string())
    }
}

pub fn describe_block(block: &Block) -> String {
    let percent = (block.battery_level_normalised() * 100.0).round() as u32;
    let mut line = format!(
        "{}  battery {}%{}  uid {}  serial {}",
        block.device_description(),
        percent,
        if block.battery_charging { " (charging)" } else { "" },
        block.uid,
        block.serial,
    );
    if !block.version.is_empty() {
        line.push_str(&format!("  version {}", block.version));
    }
    if block.is_master {
        line.push_str("  [master]");
    }
    line
}

pub fn describe_topology(topology: &BlockTopology) -> String {
    let mut out = format!(
        "Topology: {} block(s), {} connection(s)",
        topology.blocks.len(),
        topology.connections.len()
    );
    for block in &topology.blocks {
        out.push_str("\n  ");
        out.push_str(&describe_block(block));
    }
    for c in &topology.connections {
        out.push_str(&format!(
            "\n  {} {:?} <-> {} {:?}",
            c.device1, c.port1, c.device2, c.port2
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use daisy_core::{SerialNumber, Uid};

    fn block(serial: &str, master: Uid) -> Block {
        let mut block = Block::new(SerialNumber::from_str_padded(serial), 0, master);
        block.battery_level = Block::MAX_BATTERY_LEVEL;
        block
    }

    #[test]
    fn test_describe_master_block() {
        let serial = SerialNumber::from_str_padded("LPB1234567890ABC");
        let mut b = block("LPB1234567890ABC", serial.uid());
        b.version = "1.1.0".to_string();

        let line = describe_block(&b);
        assert!(line.starts_with("Lightpad BLOCK  battery 100%"));
        assert!(line.contains("serial LPB1234567890ABC"));
        assert!(line.contains("version 1.1.0"));
        assert!(line.ends_with("[master]"));
    }

    #[test]
    fn test_named_block_uses_name() {
        let mut b = block("SBB0000000000001", Uid(1));
        b.name = "Keys".to_string();
        let line = describe_block(&b);
        assert!(line.starts_with("Keys  "));
        assert!(!line.contains("[master]"));
    }

    #[test]
    fn test_topology_summary() {
        let master = SerialNumber::from_str_padded("LPB1234567890ABC").uid();
        let mut topology = BlockTopology::new();
        topology.add_block(block("LPB1234567890ABC", master));
        let text = describe_topology(&topology);
        assert!(text.starts_with("Topology: 1 block(s), 0 connection(s)\n  Lightpad BLOCK"));
    }

    #[test]
    fn test_input_can_be_hidden() {
        let event = TopologyEvent::Button {
            uid: Uid(7),
            timestamp: 0,
            button_id: 3,
            is_down: true,
        };

        let shown = Reporter {
            json: false,
            show_input: true,
        };
        assert_eq!(shown.render(&event).unwrap(), "[7] button 3 down");

        let hidden = Reporter {
            json: false,
            show_input: false,
        };
        assert!(hidden.render(&event).is_none());
    }

    #[test]
    fn test_json_topology_line() {
        let reporter = Reporter {
            json: true,
            show_input: true,
        };
        let event = TopologyEvent::TopologyChanged(BlockTopology::new());
        let line = reporter.render(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "topology");
        assert!(value["topology"]["blocks"].as_array().unwrap().is_empty());

        let ack = TopologyEvent::PacketAck {
            uid: Uid(1),
            counter: 2,
        };
        assert!(reporter.render(&ack).is_none());
    }
}
