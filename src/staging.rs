use std::collections::HashMap;

use anyhow::Result;
use log::debug;

use crate::node::{NodeId, SceneProvider};
use crate::snapshot::{Snapshot, SnapshotMap};

/// Backward search over committed history, answering "what was the
/// most recent recorded value of this node before the current frame".
///
/// `most_recent_parent` distinguishes "no entry found" (`None`, the
/// live scene already holds the right value) from "recorded as a root
/// node" (`Some(None)`).
pub trait HistoryLookup {
    fn most_recent_snapshot(&self, id: NodeId) -> Option<Snapshot>;
    fn most_recent_parent(&self, id: NodeId) -> Option<Option<NodeId>>;
}

/// Accumulator of pending insert/delete/update intents for one branch.
///
/// A node id is present in at most one of the three sets at any time;
/// the staging calls enforce the cancellation rules that keep it so.
#[derive(Debug, Default)]
pub struct StagingArea {
    inserts: Vec<NodeId>,
    deletes: SnapshotMap,
    updates: Vec<NodeId>,
    hierarchy: HashMap<NodeId, Option<NodeId>>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a node that was just created in the live scene.
    ///
    /// A pending delete for the same node cancels into an update: the
    /// node existed before the delete was staged, so the pair nets out
    /// to a content change. The captured delete snapshot is dropped.
    pub fn stage_insert(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        if self.deletes.take(id).is_some() {
            if !self.updates.contains(&id) {
                self.updates.push(id);
            }
            self.refresh_hierarchy(scene, id);
            return;
        }
        self.updates.retain(|staged| *staged != id);
        if !self.inserts.contains(&id) {
            self.inserts.push(id);
        }
        self.refresh_hierarchy(scene, id);
    }

    /// Stages a node that is about to be deleted from the live scene,
    /// capturing its full state while it is still reachable.
    ///
    /// A pending insert for the same node cancels both operations: the
    /// node never existed as far as history is concerned.
    pub fn stage_delete(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        if let Some(position) = self.inserts.iter().position(|staged| *staged == id) {
            self.inserts.remove(position);
            self.hierarchy.remove(&id);
            return;
        }
        self.updates.retain(|staged| *staged != id);
        if self.deletes.contains(id) {
            return;
        }
        match scene.serialize_node(id) {
            Ok(bytes) => {
                self.deletes.insert(id, Snapshot::new(bytes));
            }
            Err(err) => {
                debug!("ignoring stage_delete for unknown node {id}: {err}");
                return;
            }
        }
        self.refresh_hierarchy(scene, id);
    }

    /// Stages a content change. Nodes already staged as inserted or
    /// deleted keep that classification; only the hierarchy entry is
    /// refreshed.
    pub fn stage_update(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        if !self.inserts.contains(&id) && !self.deletes.contains(id) && !self.updates.contains(&id)
        {
            self.updates.push(id);
        }
        self.refresh_hierarchy(scene, id);
    }

    fn refresh_hierarchy(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        if scene.contains_node(id) {
            self.hierarchy.insert(id, scene.node_parent(id));
        }
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty() && self.updates.is_empty()
    }

    /// Discards everything, releasing all captured snapshots.
    pub fn clear(&mut self) {
        self.inserts.clear();
        self.deletes.clear();
        self.updates.clear();
        self.hierarchy.clear();
    }

    /// Moves the staged content out, leaving the area empty.
    pub fn take(&mut self) -> StagingArea {
        std::mem::take(self)
    }

    pub fn inserts(&self) -> &[NodeId] {
        &self.inserts
    }

    pub fn deletes(&self) -> &SnapshotMap {
        &self.deletes
    }

    pub fn updates(&self) -> &[NodeId] {
        &self.updates
    }

    pub fn hierarchy(&self) -> &HashMap<NodeId, Option<NodeId>> {
        &self.hierarchy
    }

    pub(crate) fn into_parts(self) -> (Vec<NodeId>, SnapshotMap, Vec<NodeId>, HashMap<NodeId, Option<NodeId>>) {
        (self.inserts, self.deletes, self.updates, self.hierarchy)
    }

    /// Computes the inverse operation set that undoes this staging
    /// area's effect on the scene.
    ///
    /// Staged inserts invert to deletes; staged deletes invert to
    /// inserts carrying the captured snapshot; staged updates invert
    /// to updates restoring the most recent prior value from history.
    /// Updates never capture content at staging time, so a node with
    /// no recorded history is omitted — the live scene already holds
    /// the fallback value.
    pub fn restore_commands(&self, history: &dyn HistoryLookup) -> RestoreCommands {
        let mut commands = RestoreCommands::default();

        commands.deletes = self.inserts.clone();
        commands.inserts = self.deletes.clone().into_sorted_vec();
        for id in &self.updates {
            if let Some(snapshot) = history.most_recent_snapshot(*id) {
                commands.updates.push((*id, snapshot));
            }
        }
        commands.updates.sort_by_key(|(id, _)| *id);

        for id in self.hierarchy.keys() {
            if commands.deletes.contains(id) {
                continue;
            }
            if let Some(parent) = history.most_recent_parent(*id) {
                commands.hierarchy.push((*id, parent));
            }
        }
        commands.hierarchy.sort_by_key(|(id, _)| *id);
        commands
    }
}

/// Computed inverse of a staging area or committed frame, ready to be
/// replayed against the live scene.
#[derive(Debug, Clone, Default)]
pub struct RestoreCommands {
    pub deletes: Vec<NodeId>,
    pub inserts: Vec<(NodeId, Snapshot)>,
    pub updates: Vec<(NodeId, Snapshot)>,
    pub hierarchy: Vec<(NodeId, Option<NodeId>)>,
}

impl RestoreCommands {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
            && self.inserts.is_empty()
            && self.updates.is_empty()
            && self.hierarchy.is_empty()
    }

    /// Replays the command set against the live scene. Deletes run
    /// before inserts, inserts before updates, updates before
    /// re-parenting; the fixed order avoids transient duplicate-id and
    /// dangling-parent states.
    pub fn apply(&self, scene: &dyn SceneProvider) -> Result<()> {
        for id in &self.deletes {
            scene.delete_node(*id);
        }
        for (id, snapshot) in &self.inserts {
            scene.restore_node(*id, snapshot.as_bytes())?;
        }
        for (id, snapshot) in &self.updates {
            scene.apply_node_snapshot(*id, snapshot.as_bytes())?;
        }
        for (id, parent) in &self.hierarchy {
            scene.set_node_parent(*id, *parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene_state::SceneState;

    struct FixedHistory {
        snapshots: HashMap<NodeId, Snapshot>,
        parents: HashMap<NodeId, Option<NodeId>>,
    }

    impl FixedHistory {
        fn empty() -> Self {
            Self {
                snapshots: HashMap::new(),
                parents: HashMap::new(),
            }
        }
    }

    impl HistoryLookup for FixedHistory {
        fn most_recent_snapshot(&self, id: NodeId) -> Option<Snapshot> {
            self.snapshots.get(&id).cloned()
        }

        fn most_recent_parent(&self, id: NodeId) -> Option<Option<NodeId>> {
            self.parents.get(&id).copied()
        }
    }

    fn scene_with_nodes(names: &[&str]) -> (SceneState, Vec<NodeId>) {
        let scene = SceneState::new();
        let ids = names.iter().map(|name| scene.spawn_node(*name, None)).collect();
        (scene, ids)
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let (scene, ids) = scene_with_nodes(&["Crate"]);
        let mut staging = StagingArea::new();

        staging.stage_insert(&scene, ids[0]);
        staging.stage_delete(&scene, ids[0]);

        assert!(staging.is_empty());
        assert!(staging.hierarchy().is_empty());
    }

    #[test]
    fn delete_then_insert_becomes_update() {
        let (scene, ids) = scene_with_nodes(&["Crate"]);
        let mut staging = StagingArea::new();

        staging.stage_delete(&scene, ids[0]);
        assert!(staging.deletes().contains(ids[0]));

        staging.stage_insert(&scene, ids[0]);
        assert!(!staging.deletes().contains(ids[0]));
        assert!(!staging.inserts().contains(&ids[0]));
        assert_eq!(staging.updates(), &[ids[0]]);
    }

    #[test]
    fn update_staging_is_idempotent() {
        let (scene, ids) = scene_with_nodes(&["Crate"]);
        let mut staging = StagingArea::new();

        staging.stage_update(&scene, ids[0]);
        staging.stage_update(&scene, ids[0]);
        assert_eq!(staging.updates(), &[ids[0]]);
    }

    #[test]
    fn update_does_not_reclassify_insert_or_delete() {
        let (scene, ids) = scene_with_nodes(&["A", "B"]);
        let mut staging = StagingArea::new();

        staging.stage_insert(&scene, ids[0]);
        staging.stage_delete(&scene, ids[1]);
        staging.stage_update(&scene, ids[0]);
        staging.stage_update(&scene, ids[1]);

        assert_eq!(staging.inserts(), &[ids[0]]);
        assert!(staging.deletes().contains(ids[1]));
        assert!(staging.updates().is_empty());
    }

    #[test]
    fn stage_delete_of_unknown_node_is_ignored() {
        let (scene, _) = scene_with_nodes(&[]);
        let mut staging = StagingArea::new();
        staging.stage_delete(&scene, 12345);
        assert!(staging.is_empty());
    }

    #[test]
    fn hierarchy_entry_tracks_live_parent() {
        let scene = SceneState::new();
        let root = scene.spawn_node("Root", None);
        let child = scene.spawn_node("Child", Some(root));

        let mut staging = StagingArea::new();
        staging.stage_update(&scene, child);
        assert_eq!(staging.hierarchy().get(&child), Some(&Some(root)));

        scene.set_node_parent(child, None);
        staging.stage_update(&scene, child);
        assert_eq!(staging.hierarchy().get(&child), Some(&None));
    }

    #[test]
    fn restore_commands_invert_the_staged_operations() {
        let scene = SceneState::new();
        let root = scene.spawn_node("Root", None);
        let inserted = scene.spawn_node("Fresh", Some(root));
        let doomed = scene.spawn_node("Doomed", Some(root));
        let touched = scene.spawn_node("Touched", Some(root));

        let mut staging = StagingArea::new();
        staging.stage_insert(&scene, inserted);
        staging.stage_delete(&scene, doomed);
        staging.stage_update(&scene, touched);

        let mut history = FixedHistory::empty();
        let prior = scene.serialize_node(touched).unwrap();
        history.snapshots.insert(touched, Snapshot::new(prior));
        history.parents.insert(touched, Some(root));
        history.parents.insert(doomed, Some(root));

        let commands = staging.restore_commands(&history);
        assert_eq!(commands.deletes, vec![inserted]);
        assert_eq!(commands.inserts.len(), 1);
        assert_eq!(commands.inserts[0].0, doomed);
        assert_eq!(commands.updates.len(), 1);
        assert_eq!(commands.updates[0].0, touched);
        // The node whose restore deletes it again gets no hierarchy
        // entry; the others are restored to their recorded parents.
        let ids: Vec<NodeId> = commands.hierarchy.iter().map(|(id, _)| *id).collect();
        assert!(!ids.contains(&inserted));
        assert!(ids.contains(&doomed));
        assert!(ids.contains(&touched));
    }

    #[test]
    fn update_without_history_is_omitted_from_restore() {
        let (scene, ids) = scene_with_nodes(&["Loner"]);
        let mut staging = StagingArea::new();
        staging.stage_update(&scene, ids[0]);

        let commands = staging.restore_commands(&FixedHistory::empty());
        assert!(commands.updates.is_empty());
    }

    #[test]
    fn clear_releases_everything() {
        let (scene, ids) = scene_with_nodes(&["A", "B"]);
        let mut staging = StagingArea::new();
        staging.stage_delete(&scene, ids[0]);
        staging.stage_update(&scene, ids[1]);

        staging.clear();
        assert!(staging.is_empty());
        assert!(staging.hierarchy().is_empty());
    }
}
