use std::collections::HashMap;
use std::sync::Arc;

use crate::node::NodeId;

/// Immutable serialized state of one scene node.
///
/// Snapshots are shared freely between frames and restore commands, so
/// the backing buffer is reference counted rather than copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Arc<[u8]>,
}

impl Snapshot {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::from(data.into_boxed_slice()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Node-keyed snapshot container.
///
/// Used by the staging area to hold the state captured for nodes that
/// are about to be deleted. Dropping the map (or calling [`clear`])
/// releases every buffer; there is no manual free path.
///
/// [`clear`]: SnapshotMap::clear
#[derive(Debug, Clone, Default)]
pub struct SnapshotMap {
    entries: HashMap<NodeId, Snapshot>,
}

impl SnapshotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot, replacing any previous one for the node.
    pub fn insert(&mut self, id: NodeId, snapshot: Snapshot) -> Option<Snapshot> {
        self.entries.insert(id, snapshot)
    }

    pub fn get(&self, id: NodeId) -> Option<&Snapshot> {
        self.entries.get(&id)
    }

    /// Removes and returns the snapshot for `id`.
    pub fn take(&mut self, id: NodeId) -> Option<Snapshot> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Snapshot)> {
        self.entries.iter().map(|(id, snapshot)| (*id, snapshot))
    }

    /// Drains the map into `(id, snapshot)` pairs sorted by node id,
    /// which keeps the committed frame encoding deterministic.
    pub fn into_sorted_vec(self) -> Vec<(NodeId, Snapshot)> {
        let mut entries: Vec<_> = self.entries.into_iter().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
