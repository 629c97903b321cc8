//! Topology rewriting
//!
//! A [`RuleBasedTopologySource`] wraps another source and presents its topology
//! after passing it through a list of rules, for example to hide blocks or to
//! add virtual connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use daisy_core::{Block, BlockTopology, ListenerId, ListenerRegistry};

use crate::source::{TopologyListener, TopologySource};

pub trait TopologyRule: Send + Sync {
    /// Modify the topology in place
    fn transform_topology(&self, topology: &mut BlockTopology);
}

impl<F> TopologyRule for F
where
    F: Fn(&mut BlockTopology) + Send + Sync,
{
    fn transform_topology(&self, topology: &mut BlockTopology) {
        self(topology)
    }
}

#[derive(Default)]
struct ChangeFlag(AtomicBool);

impl ChangeFlag {
    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

impl TopologyListener for ChangeFlag {
    fn topology_changed(&self, _topology: &BlockTopology) {
        self.set();
    }

    fn block_added(&self, _block: &Block) {
        self.set();
    }

    fn block_removed(&self, _block: &Block) {
        self.set();
    }

    fn block_updated(&self, _block: &Block) {
        self.set();
    }
}

pub struct RuleBasedTopologySource<S: TopologySource> {
    inner: S,
    rules: Vec<Box<dyn TopologyRule>>,
    topology: BlockTopology,
    listeners: ListenerRegistry<dyn TopologyListener>,
    inner_changed: Arc<ChangeFlag>,
    inner_listener: ListenerId,
    rules_changed: bool,
}

impl<S: TopologySource> RuleBasedTopologySource<S> {
    pub fn new(mut inner: S) -> Self {
        let inner_changed = Arc::new(ChangeFlag::default());
        let listener: Arc<dyn TopologyListener> = inner_changed.clone();
        let inner_listener = inner.add_listener(&listener);
        let topology = inner.current_topology();

        Self {
            inner,
            rules: Vec::new(),
            topology,
            listeners: ListenerRegistry::new(),
            inner_changed,
            inner_listener,
            rules_changed: false,
        }
    }

    /// Append a rule. Takes effect on the next tick.
    pub fn add_rule(&mut self, rule: impl TopologyRule + 'static) {
        self.rules.push(Box::new(rule));
        self.rules_changed = true;
    }

    pub fn clear_rules(&mut self) {
        if !self.rules.is_empty() {
            self.rules.clear();
            self.rules_changed = true;
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Detach from the wrapped source and return it
    pub fn into_inner(mut self) -> S {
        self.inner.remove_listener(self.inner_listener);
        self.inner
    }

    fn update(&mut self) {
        let inner_changed = self.inner_changed.take();
        let rules_changed = std::mem::take(&mut self.rules_changed);
        if inner_changed || rules_changed {
            self.regenerate();
        }
    }

    fn regenerate(&mut self) {
        let mut topology = self.inner.current_topology();
        for rule in &self.rules {
            rule.transform_topology(&mut topology);
        }

        if topology == self.topology {
            return;
        }

        debug!(
            blocks = topology.blocks.len(),
            rules = self.rules.len(),
            "Transformed topology changed"
        );
        self.topology = topology;
        for listener in self.listeners.snapshot() {
            listener.topology_changed(&self.topology);
        }
    }
}

impl<S: TopologySource> TopologySource for RuleBasedTopologySource<S> {
    fn current_topology(&self) -> BlockTopology {
        self.topology.clone()
    }

    fn set_active(&mut self, active: bool) {
        self.inner.set_active(active);
        self.update();
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    fn is_locked_from_outside(&self) -> bool {
        self.inner.is_locked_from_outside()
    }

    fn add_listener(&mut self, listener: &Arc<dyn TopologyListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn tick(&mut self, now: Instant) {
        self.inner.tick(now);
        self.update();
    }
}
