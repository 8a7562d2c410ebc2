//! Peer address → shipper name lookup.
//!
//! Readers load the current map without locking. Writers build a complete
//! new map and swap it in, so a reader sees either the old or the new map
//! in full. The writer lock only serializes concurrent writers.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub type Topology = HashMap<String, String>;

/// One published topology record: a shipper and the addresses it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub name: String,
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TopologyMap {
    current: ArcSwap<Topology>,
    writer: Mutex<()>,
}

impl TopologyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TopologyEntry>) -> Self {
        let map = Self::new();
        map.replace_entries(entries);
        map
    }

    pub fn lookup(&self, addr: &str) -> Option<String> {
        self.current.load().get(addr).cloned()
    }

    /// The whole map as of one instant.
    pub fn snapshot(&self) -> Arc<Topology> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn replace(&self, topology: Topology) {
        let _guard = self.writer.lock();
        self.current.store(Arc::new(topology));
    }

    pub fn replace_entries(&self, entries: impl IntoIterator<Item = TopologyEntry>) {
        let mut topology = Topology::new();
        for entry in entries {
            for ip in entry.ips {
                topology.insert(ip, entry.name.clone());
            }
        }
        self.replace(topology);
    }

    /// Copy-on-write edit of the current map.
    pub fn update(&self, f: impl FnOnce(&mut Topology)) {
        let _guard = self.writer.lock();
        let mut next = Topology::clone(&self.current.load());
        f(&mut next);
        self.current.store(Arc::new(next));
    }
}
