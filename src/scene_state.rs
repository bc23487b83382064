use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use glam::Mat4;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::node::{NodeId, SceneNode, SceneProvider};

/// Callbacks delivered by [`SceneState`] while it owns the frame.
///
/// `update_node` may be invoked from worker threads by embedders that
/// parallelise the update pass, so implementations must be thread
/// safe. Spawning or removing nodes from inside a callback is legal;
/// the mutation is deferred until the structural flush of the running
/// step.
pub trait SceneEvents: Send + Sync {
    fn node_inserted(&self, scene: &SceneState, id: NodeId) {
        let _ = (scene, id);
    }

    fn node_removed(&self, scene: &SceneState, id: NodeId) {
        let _ = (scene, id);
    }

    fn update_node(&self, scene: &SceneState, id: NodeId, dt: f32) {
        let _ = (scene, id, dt);
    }

    fn do_physics(&self, scene: &SceneState, dt: f32) {
        let _ = (scene, dt);
    }

    fn node_transform_resolved(&self, scene: &SceneState, id: NodeId) {
        let _ = (scene, id);
    }
}

/// Event sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl SceneEvents for NoopEvents {}

#[derive(Default)]
struct DeferredOps {
    /// Nodes queued for insertion, with the enabled flag they should
    /// regain once they join the scene.
    inserts: Vec<(SceneNode, bool)>,
    removes: Vec<NodeId>,
    deletes: Vec<NodeId>,
}

/// The live scene graph container.
///
/// Cloning produces another handle onto the same scene. Structural
/// mutation (insert/remove/delete) takes effect immediately while the
/// scene is idle; during a [`step`] it is queued and flushed after the
/// update, physics and transform phases, so a node spawned or
/// destroyed as a reaction to another node's update never perturbs
/// the update order of the step in progress.
///
/// [`step`]: SceneState::step
pub struct SceneState {
    nodes: Arc<RwLock<HashMap<NodeId, SceneNode>>>,
    /// Protects the deferred queues against producer threads running
    /// update callbacks concurrently with the stepping thread.
    deferred: Arc<Mutex<DeferredOps>>,
    stepping: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    events: Arc<dyn SceneEvents>,
}

impl std::fmt::Debug for SceneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneState")
            .field("nodes", &self.nodes.read().len())
            .field("stepping", &self.is_stepping())
            .finish()
    }
}

impl Clone for SceneState {
    fn clone(&self) -> Self {
        Self {
            nodes: Arc::clone(&self.nodes),
            deferred: Arc::clone(&self.deferred),
            stepping: Arc::clone(&self.stepping),
            next_id: Arc::clone(&self.next_id),
            events: Arc::clone(&self.events),
        }
    }
}

impl Default for SceneState {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneState {
    pub fn new() -> Self {
        Self::with_events(Arc::new(NoopEvents))
    }

    pub fn with_events(events: Arc<dyn SceneEvents>) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            deferred: Arc::new(Mutex::new(DeferredOps::default())),
            stepping: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    /// Allocates a fresh node id, never reused within the process.
    pub fn allocate_node_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates and inserts a node in one call, returning its id. The
    /// id is valid immediately even if the insertion itself is
    /// deferred by a running step.
    pub fn spawn_node(&self, name: impl Into<String>, parent: Option<NodeId>) -> NodeId {
        let id = self.allocate_node_id();
        let mut node = SceneNode::new(id, name);
        node.parent = parent.filter(|parent| self.contains_node(*parent));
        self.insert_node(node);
        id
    }

    /// Inserts a node. Deferred while a step is in progress; the node
    /// is kept disabled until it joins the scene so the in-progress
    /// update pass cannot observe it.
    pub fn insert_node(&self, mut node: SceneNode) {
        self.next_id.fetch_max(node.id() + 1, Ordering::Relaxed);
        if self.is_stepping() {
            let enabled = node.enabled;
            node.enabled = false;
            self.deferred.lock().inserts.push((node, enabled));
            return;
        }
        let id = node.id();
        self.nodes.write().insert(id, node);
        self.events.node_inserted(self, id);
    }

    /// Detaches a node from the scene and hands it back. Children are
    /// re-rooted. Returns `None` for unknown ids, and also while a
    /// step is in progress (the removal is queued and the node is
    /// dropped at the flush).
    pub fn remove_node(&self, id: NodeId) -> Option<SceneNode> {
        if self.is_stepping() {
            self.deferred.lock().removes.push(id);
            return None;
        }
        let node = self.detach(id)?;
        self.events.node_removed(self, id);
        Some(node)
    }

    /// Deletes a node outright. Deferred while a step is in progress.
    pub fn delete_node(&self, id: NodeId) {
        if self.is_stepping() {
            self.deferred.lock().deletes.push(id);
            return;
        }
        if self.detach(id).is_some() {
            self.events.node_removed(self, id);
        }
    }

    fn detach(&self, id: NodeId) -> Option<SceneNode> {
        let mut nodes = self.nodes.write();
        let node = nodes.remove(&id)?;
        for other in nodes.values_mut() {
            if other.parent == Some(id) {
                other.parent = None;
            }
        }
        Some(node)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// Returns a clone of the node.
    pub fn node(&self, id: NodeId) -> Option<SceneNode> {
        self.nodes.read().get(&id).cloned()
    }

    /// Applies a mutation to the node's content.
    pub fn with_node_mut<F, R>(&self, id: NodeId, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut SceneNode) -> R,
    {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(&id)?;
        Some(mutate(node))
    }

    pub fn node_parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.read().get(&id).and_then(|node| node.parent)
    }

    /// Re-parents a node. A parent id that is not present in the
    /// scene re-roots the node instead.
    pub fn set_node_parent(&self, id: NodeId, parent: Option<NodeId>) {
        let mut nodes = self.nodes.write();
        let parent = parent.filter(|parent| *parent != id && nodes.contains_key(parent));
        if let Some(node) = nodes.get_mut(&id) {
            node.parent = parent;
        }
    }

    pub fn set_node_enabled(&self, id: NodeId, enabled: bool) -> bool {
        self.with_node_mut(id, |node| node.enabled = enabled).is_some()
    }

    /// Ids of all nodes currently in the scene, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::Acquire)
    }

    /// Runs one simulation step: update, physics, transform
    /// resolution, deferred structural flush, cleanup. Nested calls
    /// are ignored.
    pub fn step(&self, dt: f32) {
        if self.stepping.swap(true, Ordering::AcqRel) {
            debug!("ignoring nested scene step");
            return;
        }

        let enabled: Vec<NodeId> = {
            let nodes = self.nodes.read();
            let mut ids: Vec<NodeId> = nodes
                .values()
                .filter(|node| node.enabled)
                .map(SceneNode::id)
                .collect();
            ids.sort_unstable();
            ids
        };
        for id in enabled {
            self.events.update_node(self, id, dt);
        }

        self.events.do_physics(self, dt);

        self.resolve_transforms();
        for id in self.node_ids() {
            self.events.node_transform_resolved(self, id);
        }

        // Structural flush: removals and deletions first, then the
        // insertions queued during the step.
        let ops = std::mem::take(&mut *self.deferred.lock());
        let mut graveyard = Vec::new();
        for id in ops.removes {
            if let Some(node) = self.detach(id) {
                self.events.node_removed(self, id);
                drop(node);
            }
        }
        for id in ops.deletes {
            if let Some(node) = self.detach(id) {
                self.events.node_removed(self, id);
                graveyard.push(node);
            }
        }
        for (mut node, enabled) in ops.inserts {
            node.enabled = enabled;
            let id = node.id();
            self.nodes.write().insert(id, node);
            self.events.node_inserted(self, id);
        }

        // Cleanup: everything marked deleted during the step goes away
        // for good here.
        drop(graveyard);

        self.stepping.store(false, Ordering::Release);
    }

    /// Recomputes world transforms across the parent hierarchy. A
    /// parent cycle re-roots the affected nodes instead of recursing
    /// forever.
    pub fn resolve_transforms(&self) {
        let mut nodes = self.nodes.write();
        let ids: Vec<NodeId> = nodes.keys().copied().collect();
        let mut resolved: HashMap<NodeId, Mat4> = HashMap::with_capacity(ids.len());
        for id in &ids {
            let mut trail = Vec::new();
            resolve_world(*id, &nodes, &mut resolved, &mut trail);
        }
        for (id, world) in resolved {
            if let Some(node) = nodes.get_mut(&id) {
                node.world_transform = world;
            }
        }
    }
}

fn resolve_world(
    id: NodeId,
    nodes: &HashMap<NodeId, SceneNode>,
    resolved: &mut HashMap<NodeId, Mat4>,
    trail: &mut Vec<NodeId>,
) -> Mat4 {
    if let Some(world) = resolved.get(&id) {
        return *world;
    }
    let node = match nodes.get(&id) {
        Some(node) => node,
        None => return Mat4::IDENTITY,
    };
    let local = node.local_transform();
    let world = match node.parent {
        Some(parent) if nodes.contains_key(&parent) && !trail.contains(&id) => {
            trail.push(id);
            resolve_world(parent, nodes, resolved, trail) * local
        }
        _ => local,
    };
    resolved.insert(id, world);
    world
}

impl SceneProvider for SceneState {
    fn contains_node(&self, id: NodeId) -> bool {
        SceneState::contains_node(self, id)
    }

    fn node_parent(&self, id: NodeId) -> Option<NodeId> {
        SceneState::node_parent(self, id)
    }

    fn serialize_node(&self, id: NodeId) -> Result<Vec<u8>> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(&id)
            .ok_or_else(|| anyhow!("unknown scene node {id}"))?;
        node.encode_snapshot()
    }

    fn apply_node_snapshot(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&id) {
            Some(node) => node.apply_snapshot(bytes),
            None => {
                debug!("ignoring snapshot for unknown node {id}");
                Ok(())
            }
        }
    }

    fn restore_node(&self, id: NodeId, bytes: &[u8]) -> Result<()> {
        if self.contains_node(id) {
            return self.apply_node_snapshot(id, bytes);
        }
        let node = SceneNode::from_snapshot(id, bytes)?;
        self.insert_node(node);
        Ok(())
    }

    fn delete_node(&self, id: NodeId) {
        SceneState::delete_node(self, id);
    }

    fn set_node_parent(&self, id: NodeId, parent: Option<NodeId>) {
        SceneState::set_node_parent(self, id, parent);
    }
}
