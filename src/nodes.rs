/// live cache-node tracking
///
use dashmap::DashSet;
use log::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Node ids last seen alive, plus the expected-node-count estimate used
/// for quorum-style reasoning by callers.  Only the heartbeat monitor
/// inserts; the reconciler snapshots.  The estimate starts at one and
/// never shrinks spontaneously.
pub struct NodeSet {
    nodes: DashSet<String>,
    expected: AtomicUsize,
}

impl Default for NodeSet {
    fn default() -> NodeSet {
        NodeSet {
            nodes: DashSet::new(),
            expected: AtomicUsize::new(1),
        }
    }
}

impl NodeSet {
    pub fn new() -> NodeSet {
        NodeSet::default()
    }

    /// record a node id seen in a pong
    pub fn observe(&self, node_id: &str) {
        if self.nodes.insert(node_id.to_string()) {
            info!("discovered cache node: {}", node_id);
        }
    }

    /// roll the observed set into the expected count; a quiet (empty) set
    /// leaves the previous estimate in place
    pub fn reconcile(&self) {
        let size = self.nodes.len();
        if size > 0 {
            self.expected.store(size, Ordering::SeqCst);
        }
    }

    /// number of distinct nodes observed alive
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// the last reconciled expected-node-count estimate
    pub fn expected(&self) -> usize {
        self.expected.load(Ordering::SeqCst)
    }
}
