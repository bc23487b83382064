use anyhow::{Context, Result};
use log::{debug, warn};

use crate::chunk::{Chunk, ChunkWriter, CHUNK_BRANCH, CHUNK_FRAME};
use crate::node::{NodeId, SceneProvider};
use crate::snapshot::Snapshot;
use crate::staging::{HistoryLookup, RestoreCommands, StagingArea};

/// Identifier of a branch within a state stack. Zero is reserved for
/// the master branch.
pub type BranchId = u32;

/// The permanent primary timeline.
pub const MASTER_BRANCH: BranchId = 0;

const FRAME_CHUNK_VERSION: u32 = 1;
const BRANCH_CHUNK_VERSION: u32 = 1;

/// Sentinel for "no frame" in the persisted cursor and fork fields.
const NO_FRAME: u32 = u32::MAX;

/// Where a branch forked from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLink {
    pub branch: BranchId,
    /// Frame index in the parent at the moment of the fork; `None`
    /// when the parent had no committed frames yet.
    pub frame: Option<usize>,
}

/// An immutable committed record of one staging area's net effect.
///
/// Deletes carry the snapshot captured when they were staged; inserts
/// and updates are snapshotted at commit time, which is what makes
/// redo (and redo after a reload) possible. Insert and update entries
/// keep their staging order — hierarchy rebuild depends on it.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    inserts: Vec<(NodeId, Snapshot)>,
    deletes: Vec<(NodeId, Snapshot)>,
    updates: Vec<(NodeId, Snapshot)>,
    hierarchy: Vec<(NodeId, Option<NodeId>)>,
}

impl Frame {
    /// Freezes a staging area into a committed frame, capturing the
    /// current serialized state of inserted and updated nodes.
    pub(crate) fn freeze(staging: StagingArea, scene: &dyn SceneProvider) -> Frame {
        let (inserts, deletes, updates, hierarchy) = staging.into_parts();
        let mut frame = Frame::default();

        for id in inserts {
            match scene.serialize_node(id) {
                Ok(bytes) => frame.inserts.push((id, Snapshot::new(bytes))),
                Err(err) => debug!("dropping staged insert for vanished node {id}: {err}"),
            }
        }
        frame.deletes = deletes.into_sorted_vec();
        for id in updates {
            match scene.serialize_node(id) {
                Ok(bytes) => frame.updates.push((id, Snapshot::new(bytes))),
                Err(err) => debug!("dropping staged update for vanished node {id}: {err}"),
            }
        }
        frame.hierarchy = hierarchy.into_iter().collect();
        frame.hierarchy.sort_by_key(|(id, _)| *id);
        frame
    }

    pub fn inserts(&self) -> &[(NodeId, Snapshot)] {
        &self.inserts
    }

    pub fn deletes(&self) -> &[(NodeId, Snapshot)] {
        &self.deletes
    }

    pub fn updates(&self) -> &[(NodeId, Snapshot)] {
        &self.updates
    }

    pub fn hierarchy(&self) -> &[(NodeId, Option<NodeId>)] {
        &self.hierarchy
    }

    /// Most recent serialized state of `id` known to this frame: the
    /// commit-time snapshot for inserts and updates, the pre-delete
    /// capture for deletes.
    pub fn snapshot_of(&self, id: NodeId) -> Option<&Snapshot> {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
            .find(|(node, _)| *node == id)
            .map(|(_, snapshot)| snapshot)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<Option<NodeId>> {
        self.hierarchy
            .iter()
            .find(|(node, _)| *node == id)
            .map(|(_, parent)| *parent)
    }

    /// Forward (redo) application of this frame.
    pub(crate) fn redo_commands(&self) -> RestoreCommands {
        let deleted: Vec<NodeId> = self.deletes.iter().map(|(id, _)| *id).collect();
        RestoreCommands {
            deletes: deleted.clone(),
            inserts: self.inserts.clone(),
            updates: self.updates.clone(),
            hierarchy: self
                .hierarchy
                .iter()
                .filter(|(id, _)| !deleted.contains(id))
                .copied()
                .collect(),
        }
    }

    /// Inverse (undo) application of this frame. Prior values come
    /// from `history`, which must answer lookups as of the frame just
    /// before this one.
    pub(crate) fn undo_commands(&self, history: &dyn HistoryLookup) -> RestoreCommands {
        let mut commands = RestoreCommands {
            deletes: self.inserts.iter().map(|(id, _)| *id).collect(),
            inserts: self.deletes.clone(),
            ..RestoreCommands::default()
        };
        for (id, _) in &self.updates {
            if let Some(snapshot) = history.most_recent_snapshot(*id) {
                commands.updates.push((*id, snapshot));
            }
        }
        for (id, _) in &self.hierarchy {
            if commands.deletes.contains(id) {
                continue;
            }
            if let Some(parent) = history.most_recent_parent(*id) {
                commands.hierarchy.push((*id, parent));
            }
        }
        commands
    }

    pub(crate) fn encode(&self, writer: &mut ChunkWriter) {
        writer.chunk(CHUNK_FRAME, FRAME_CHUNK_VERSION, |w| {
            for set in [&self.inserts, &self.deletes, &self.updates] {
                w.write_u32(set.len() as u32);
                for (id, snapshot) in set.iter() {
                    w.write_u64(*id);
                    w.write_u32(snapshot.len() as u32);
                    w.write_bytes(snapshot.as_bytes());
                }
            }
            w.write_u32(self.hierarchy.len() as u32);
            for (id, parent) in &self.hierarchy {
                w.write_u64(*id);
                w.write_u64(parent.unwrap_or(0));
            }
        });
    }

    /// Decodes a `FRME` chunk. Returns `None` for unsupported
    /// versions, which the caller skips.
    pub(crate) fn decode(chunk: Chunk<'_>) -> Result<Option<Frame>> {
        let chunk = chunk.expect(CHUNK_FRAME)?;
        if chunk.version != FRAME_CHUNK_VERSION {
            warn!("skipping frame chunk with unsupported version {}", chunk.version);
            return Ok(None);
        }
        let mut reader = chunk.reader();
        let mut frame = Frame::default();
        for set in [&mut frame.inserts, &mut frame.deletes, &mut frame.updates] {
            let count = reader.read_u32("snapshot count")?;
            for _ in 0..count {
                let id = reader.read_u64("node id")?;
                let len = reader.read_u32("snapshot length")? as usize;
                let bytes = reader.read_bytes(len, "snapshot payload")?;
                set.push((id, Snapshot::new(bytes.to_vec())));
            }
        }
        let count = reader.read_u32("hierarchy count")?;
        for _ in 0..count {
            let id = reader.read_u64("node id")?;
            let parent = reader.read_u64("parent id")?;
            frame.hierarchy.push((id, (parent != 0).then_some(parent)));
        }
        Ok(Some(frame))
    }
}

/// An independent undo/redo timeline of committed frames, optionally
/// forked from another branch's frame.
#[derive(Debug)]
pub struct Branch {
    id: BranchId,
    parent: Option<BranchLink>,
    children: Vec<BranchId>,
    frames: Vec<Frame>,
    /// Index of the current frame; `None` iff the branch has no
    /// committed frames yet.
    cursor: Option<usize>,
    staging: StagingArea,
}

impl Branch {
    pub(crate) fn new(id: BranchId, parent: Option<BranchLink>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            frames: Vec::new(),
            cursor: None,
            staging: StagingArea::new(),
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn parent(&self) -> Option<BranchLink> {
        self.parent
    }

    pub fn children(&self) -> &[BranchId] {
        &self.children
    }

    pub(crate) fn add_child(&mut self, child: BranchId) {
        self.children.push(child);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub(crate) fn staging_mut(&mut self) -> &mut StagingArea {
        &mut self.staging
    }

    pub fn stage_insert(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        self.staging.stage_insert(scene, id);
    }

    pub fn stage_delete(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        self.staging.stage_delete(scene, id);
    }

    pub fn stage_update(&mut self, scene: &dyn SceneProvider, id: NodeId) {
        self.staging.stage_update(scene, id);
    }

    /// Discards uncommitted staging without touching the scene.
    pub fn revert_staging(&mut self) {
        self.staging.clear();
    }

    /// Freezes the staging area into a new frame. Committing while the
    /// cursor sits before the last frame truncates the forward frames
    /// first, standard undo-stack behaviour. Returns `false` (and
    /// commits nothing) when the staging area is empty.
    pub(crate) fn commit(&mut self, scene: &dyn SceneProvider) -> bool {
        if self.staging.is_empty() {
            debug!("ignoring commit with empty staging area on branch {}", self.id);
            return false;
        }
        if let Some(cursor) = self.cursor {
            self.frames.truncate(cursor + 1);
        }
        let frame = Frame::freeze(self.staging.take(), scene);
        self.frames.push(frame);
        self.cursor = Some(self.frames.len() - 1);
        true
    }

    /// Moves the cursor by `step` frames, clamped to the committed
    /// range. Returns the new cursor, or `None` when the branch has no
    /// frames to seek through. Seeking never touches the scene.
    pub fn seek(&mut self, step: isize) -> Option<usize> {
        let cursor = self.cursor?;
        let last = (self.frames.len() - 1) as isize;
        let target = (cursor as isize + step).clamp(0, last);
        self.cursor = Some(target as usize);
        self.cursor
    }

    pub(crate) fn encode(&self, writer: &mut ChunkWriter) {
        writer.chunk(CHUNK_BRANCH, BRANCH_CHUNK_VERSION, |w| {
            let fork = self
                .parent
                .and_then(|link| link.frame)
                .map_or(NO_FRAME, |frame| frame as u32);
            w.write_u32(fork);
            w.write_u32(self.cursor.map_or(NO_FRAME, |cursor| cursor as u32));
            w.write_u32(self.frames.len() as u32);
            for frame in &self.frames {
                frame.encode(w);
            }
        });
    }

    /// Decodes a `BRCH` chunk into a branch attached to
    /// `parent_branch`. An unsupported branch version degrades to an
    /// empty branch rather than failing the whole stack load.
    pub(crate) fn decode(
        id: BranchId,
        parent_branch: Option<BranchId>,
        chunk: Chunk<'_>,
    ) -> Result<Branch> {
        let chunk = chunk.expect(CHUNK_BRANCH)?;
        if chunk.version != BRANCH_CHUNK_VERSION {
            warn!(
                "skipping history of branch {id} with unsupported version {}",
                chunk.version
            );
            return Ok(Branch::new(
                id,
                parent_branch.map(|branch| BranchLink { branch, frame: None }),
            ));
        }

        let mut reader = chunk.reader();
        let fork = reader.read_u32("fork frame index")?;
        let cursor = reader.read_u32("cursor")?;
        let frame_count = reader.read_u32("frame count")?;

        let parent = parent_branch.map(|branch| BranchLink {
            branch,
            frame: (fork != NO_FRAME).then_some(fork as usize),
        });
        let mut branch = Branch::new(id, parent);
        for _ in 0..frame_count {
            let frame_chunk = reader
                .read_chunk()
                .with_context(|| format!("unable to read frame of branch {id}"))?;
            if let Some(frame) = Frame::decode(frame_chunk)? {
                branch.frames.push(frame);
            }
        }
        // Skipped frames shift indices, so re-clamp the cursor.
        branch.cursor = if branch.frames.is_empty() {
            None
        } else {
            Some((cursor as usize).min(branch.frames.len() - 1))
        };
        Ok(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkReader;
    use crate::scene_state::SceneState;

    fn branch_with_frames(scene: &SceneState, count: usize) -> Branch {
        let mut branch = Branch::new(MASTER_BRANCH, None);
        for index in 0..count {
            let id = scene.spawn_node(format!("Node{index}"), None);
            branch.stage_insert(scene, id);
            assert!(branch.commit(scene));
        }
        branch
    }

    #[test]
    fn commit_freezes_staging_and_advances_cursor() {
        let scene = SceneState::new();
        let id = scene.spawn_node("Crate", None);

        let mut branch = Branch::new(MASTER_BRANCH, None);
        branch.stage_insert(&scene, id);
        assert!(branch.commit(&scene));

        assert_eq!(branch.frame_count(), 1);
        assert_eq!(branch.cursor(), Some(0));
        assert!(branch.staging().is_empty());
        assert!(branch.frames()[0].snapshot_of(id).is_some());
    }

    #[test]
    fn empty_commit_is_a_no_op() {
        let scene = SceneState::new();
        let mut branch = Branch::new(MASTER_BRANCH, None);
        assert!(!branch.commit(&scene));
        assert_eq!(branch.frame_count(), 0);
        assert_eq!(branch.cursor(), None);
    }

    #[test]
    fn seek_clamps_to_committed_range() {
        let scene = SceneState::new();
        let mut branch = branch_with_frames(&scene, 3);

        assert_eq!(branch.seek(-1), Some(1));
        assert_eq!(branch.seek(-10), Some(0));
        assert_eq!(branch.seek(2), Some(2));
        assert_eq!(branch.seek(5), Some(2));
    }

    #[test]
    fn seek_on_empty_branch_is_a_no_op() {
        let mut branch = Branch::new(MASTER_BRANCH, None);
        assert_eq!(branch.seek(-1), None);
        assert_eq!(branch.cursor(), None);
    }

    #[test]
    fn commit_after_undo_truncates_redo_frames() {
        let scene = SceneState::new();
        let mut branch = branch_with_frames(&scene, 3);

        branch.seek(-2);
        assert_eq!(branch.cursor(), Some(0));

        let id = scene.spawn_node("Replacement", None);
        branch.stage_insert(&scene, id);
        assert!(branch.commit(&scene));

        assert_eq!(branch.frame_count(), 2);
        assert_eq!(branch.cursor(), Some(1));
        assert!(branch.frames()[1].snapshot_of(id).is_some());
    }

    #[test]
    fn frame_round_trip_through_chunks() {
        let scene = SceneState::new();
        let root = scene.spawn_node("Root", None);
        let child = scene.spawn_node("Child", Some(root));
        let doomed = scene.spawn_node("Doomed", Some(root));

        let mut staging = StagingArea::new();
        staging.stage_insert(&scene, child);
        staging.stage_delete(&scene, doomed);
        staging.stage_update(&scene, root);
        let frame = Frame::freeze(staging, &scene);

        let mut writer = ChunkWriter::new();
        frame.encode(&mut writer);
        let bytes = writer.into_bytes();

        let chunk = ChunkReader::new(&bytes).read_chunk().unwrap();
        let decoded = Frame::decode(chunk).unwrap().expect("supported version");
        assert_eq!(decoded.inserts().len(), 1);
        assert_eq!(decoded.deletes().len(), 1);
        assert_eq!(decoded.updates().len(), 1);
        assert_eq!(decoded.parent_of(child), Some(Some(root)));
        assert_eq!(
            decoded.snapshot_of(child).unwrap(),
            frame.snapshot_of(child).unwrap()
        );
    }

    #[test]
    fn branch_round_trip_preserves_cursor_and_fork() {
        let scene = SceneState::new();
        let mut branch = branch_with_frames(&scene, 2);
        branch.parent = Some(BranchLink {
            branch: MASTER_BRANCH,
            frame: Some(1),
        });
        branch.seek(-1);

        let mut writer = ChunkWriter::new();
        branch.encode(&mut writer);
        let bytes = writer.into_bytes();

        let chunk = ChunkReader::new(&bytes).read_chunk().unwrap();
        let decoded = Branch::decode(branch.id(), Some(MASTER_BRANCH), chunk).unwrap();
        assert_eq!(decoded.frame_count(), 2);
        assert_eq!(decoded.cursor(), Some(0));
        assert_eq!(
            decoded.parent(),
            Some(BranchLink {
                branch: MASTER_BRANCH,
                frame: Some(1),
            })
        );
    }

    #[test]
    fn stale_branch_version_degrades_to_empty_branch() {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_BRANCH, 999, |w| w.write_bytes(&[0xff; 8]));
        let bytes = writer.into_bytes();

        let chunk = ChunkReader::new(&bytes).read_chunk().unwrap();
        let decoded = Branch::decode(3, Some(MASTER_BRANCH), chunk).unwrap();
        assert_eq!(decoded.frame_count(), 0);
        assert_eq!(decoded.cursor(), None);
    }
}
