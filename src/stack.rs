use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::warn;

use crate::branch::{Branch, BranchId, BranchLink, MASTER_BRANCH};
use crate::chunk::{ChunkReader, ChunkWriter, CHUNK_STACK};
use crate::node::{NodeId, SceneProvider};
use crate::snapshot::Snapshot;
use crate::staging::{HistoryLookup, RestoreCommands};

const STACK_CHUNK_VERSION: u32 = 1;

/// A position in the branch tree: a branch and its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackPos {
    branch: BranchId,
    cursor: Option<usize>,
}

fn cursor_i64(cursor: Option<usize>) -> i64 {
    cursor.map_or(-1, |cursor| cursor as i64)
}

/// Owner of the branch tree and router of all staging, commit, seek
/// and apply operations to the current branch.
///
/// Branches live in a flat map keyed by id and refer to each other by
/// id only, so the tree carries no ownership cycles. The stack tracks
/// which position the live scene last reflected and
/// [`apply_to_scene`] replays the difference, frame by frame, through
/// the common ancestor of the old and new positions.
///
/// [`apply_to_scene`]: StateStack::apply_to_scene
pub struct StateStack {
    scene: Arc<dyn SceneProvider>,
    branches: BTreeMap<BranchId, Branch>,
    current: BranchId,
    next_branch_id: BranchId,
    applied: StackPos,
}

impl std::fmt::Debug for StateStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStack")
            .field("branches", &self.branches.len())
            .field("current", &self.current)
            .finish()
    }
}

impl StateStack {
    /// Creates a stack with a single empty master branch.
    pub fn new(scene: Arc<dyn SceneProvider>) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(MASTER_BRANCH, Branch::new(MASTER_BRANCH, None));
        Self {
            scene,
            branches,
            current: MASTER_BRANCH,
            next_branch_id: MASTER_BRANCH + 1,
            applied: StackPos {
                branch: MASTER_BRANCH,
                cursor: None,
            },
        }
    }

    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn current_branch_id(&self) -> BranchId {
        self.current
    }

    pub fn current_branch(&self) -> &Branch {
        &self.branches[&self.current]
    }

    fn current_branch_mut(&mut self) -> &mut Branch {
        self.branches
            .get_mut(&self.current)
            .expect("current branch is always registered")
    }

    /// True once the master branch has committed its first frame (the
    /// snapshot of a freshly loaded scene).
    pub fn has_initial_frame(&self) -> bool {
        self.branches[&MASTER_BRANCH].frame_count() > 0
    }

    /// Forks a new branch from the current branch's current frame and
    /// returns its id. Ids increase monotonically and are never
    /// reused within a session.
    pub fn create_branch(&mut self) -> BranchId {
        let id = self.next_branch_id;
        self.next_branch_id += 1;

        let link = BranchLink {
            branch: self.current,
            frame: self.current_branch().cursor(),
        };
        self.current_branch_mut().add_child(id);
        self.branches.insert(id, Branch::new(id, Some(link)));
        id
    }

    /// Makes `id` the current branch. Returns `false` for unknown
    /// ids. Does not touch the live scene; call
    /// [`apply_to_scene`](StateStack::apply_to_scene) afterwards to
    /// synchronise it.
    pub fn switch_branch(&mut self, id: BranchId) -> bool {
        if !self.branches.contains_key(&id) {
            return false;
        }
        self.current = id;
        true
    }

    pub fn stage_insert(&mut self, id: NodeId) {
        let scene = Arc::clone(&self.scene);
        self.current_branch_mut().stage_insert(scene.as_ref(), id);
    }

    pub fn stage_delete(&mut self, id: NodeId) {
        let scene = Arc::clone(&self.scene);
        self.current_branch_mut().stage_delete(scene.as_ref(), id);
    }

    pub fn stage_update(&mut self, id: NodeId) {
        let scene = Arc::clone(&self.scene);
        self.current_branch_mut().stage_update(scene.as_ref(), id);
    }

    /// Commits the current branch's staging area into a new frame.
    /// The live scene already reflects the committed edits, so the
    /// committed position becomes the applied position. Returns
    /// `false` when nothing was staged.
    pub fn commit(&mut self) -> bool {
        let scene = Arc::clone(&self.scene);
        let committed = self.current_branch_mut().commit(scene.as_ref());
        if committed {
            self.applied = StackPos {
                branch: self.current,
                cursor: self.current_branch().cursor(),
            };
        }
        committed
    }

    /// Moves the current branch's cursor. Clamped to the committed
    /// range; the scene is untouched until
    /// [`apply_to_scene`](StateStack::apply_to_scene).
    pub fn seek(&mut self, step: isize) -> Option<usize> {
        self.current_branch_mut().seek(step)
    }

    /// Discards uncommitted staging without touching the scene.
    pub fn revert_staging(&mut self) {
        self.current_branch_mut().revert_staging();
    }

    /// Resets the current branch's staging area.
    pub fn clear_staging(&mut self) {
        self.current_branch_mut().staging_mut().clear();
    }

    /// Inverse of the current branch's uncommitted staging area,
    /// resolving prior update values against committed history.
    pub fn uncommitted_restore_commands(&self) -> RestoreCommands {
        let branch = self.current_branch();
        let before = branch.cursor().map_or(0, |cursor| cursor + 1);
        let history = HistoryView {
            stack: self,
            branch: self.current,
            before,
        };
        branch.staging().restore_commands(&history)
    }

    /// Resets the stack to a single empty master branch, discarding
    /// all branches and frame history. Used when loading a new scene.
    pub fn clear(&mut self) {
        self.branches.clear();
        self.branches
            .insert(MASTER_BRANCH, Branch::new(MASTER_BRANCH, None));
        self.current = MASTER_BRANCH;
        self.next_branch_id = MASTER_BRANCH + 1;
        self.applied = StackPos {
            branch: MASTER_BRANCH,
            cursor: None,
        };
    }

    /// Most recent serialized state of `id` recorded strictly before
    /// frame `before` of `branch`, following the fork chain into
    /// ancestor branches. `None` means the node predates all recorded
    /// frames and the live scene already holds the right value.
    pub fn find_most_recent_snapshot(
        &self,
        branch: BranchId,
        before: usize,
        id: NodeId,
    ) -> Option<Snapshot> {
        self.walk_history(branch, before, |frame| frame.snapshot_of(id).cloned())
    }

    /// Most recent recorded parent of `id` strictly before frame
    /// `before` of `branch`.
    pub fn find_most_recent_parent(
        &self,
        branch: BranchId,
        before: usize,
        id: NodeId,
    ) -> Option<Option<NodeId>> {
        self.walk_history(branch, before, |frame| frame.parent_of(id))
    }

    fn walk_history<T>(
        &self,
        branch: BranchId,
        before: usize,
        mut visit: impl FnMut(&crate::branch::Frame) -> Option<T>,
    ) -> Option<T> {
        let mut branch = self.branches.get(&branch)?;
        let mut before = before.min(branch.frame_count());
        loop {
            for frame in branch.frames()[..before].iter().rev() {
                if let Some(found) = visit(frame) {
                    return Some(found);
                }
            }
            let link = branch.parent()?;
            branch = self.branches.get(&link.branch)?;
            before = link
                .frame
                .map_or(0, |frame| frame + 1)
                .min(branch.frame_count());
        }
    }

    /// Synchronises the live scene with the current branch position.
    ///
    /// The route from the last applied position runs through the
    /// common ancestor branch: frames are undone up the old lineage,
    /// the cursor difference inside the ancestor is undone or redone,
    /// and frames are replayed down the new lineage. Each frame's
    /// command set applies deletes, then inserts, then updates, then
    /// re-parenting.
    pub fn apply_to_scene(&mut self) -> Result<()> {
        let target = StackPos {
            branch: self.current,
            cursor: self.current_branch().cursor(),
        };
        if self.applied == target {
            return Ok(());
        }

        let from = self.anchors(self.applied);
        let to = self.anchors(target);
        let mut common = 0;
        while common < from.len() && common < to.len() && from[common].0 == to[common].0 {
            common += 1;
        }
        debug_assert!(common > 0, "all lineages share the master branch");

        let mut route: Vec<RestoreCommands> = Vec::new();

        // Undo whole branches up the old lineage.
        for level in (common..from.len()).rev() {
            let (branch, cursor) = from[level];
            for index in (0..=cursor).rev() {
                route.push(self.undo_frame(branch, index as usize));
            }
        }

        // Undo or redo within the common ancestor.
        let (ancestor, from_cursor) = from[common - 1];
        let (_, to_cursor) = to[common - 1];
        if from_cursor > to_cursor {
            for index in ((to_cursor + 1)..=from_cursor).rev() {
                route.push(self.undo_frame(ancestor, index as usize));
            }
        } else {
            for index in (from_cursor + 1)..=to_cursor {
                route.push(self.redo_frame(ancestor, index as usize));
            }
        }

        // Redo whole branches down the new lineage.
        for &(branch, cursor) in &to[common..] {
            for index in 0..=cursor {
                route.push(self.redo_frame(branch, index as usize));
            }
        }

        for commands in route {
            commands
                .apply(self.scene.as_ref())
                .context("unable to apply restore commands to scene")?;
        }
        self.applied = target;
        Ok(())
    }

    /// Root-first lineage of a position. Every entry carries the
    /// cursor at which the route passes through that branch: the fork
    /// index of the next branch in the chain, or the position's own
    /// cursor for the terminal entry. Fork indices pointing past a
    /// truncated parent tip are clamped.
    fn anchors(&self, pos: StackPos) -> Vec<(BranchId, i64)> {
        let mut chain = vec![(pos.branch, cursor_i64(pos.cursor))];
        let mut current = pos.branch;
        while let Some(link) = self.branches[&current].parent() {
            let parent_tip = cursor_i64(self.branches[&link.branch].frame_count().checked_sub(1));
            let fork = cursor_i64(link.frame).min(parent_tip);
            chain.push((link.branch, fork));
            current = link.branch;
        }
        chain.reverse();
        chain
    }

    fn undo_frame(&self, branch: BranchId, index: usize) -> RestoreCommands {
        let history = HistoryView {
            stack: self,
            branch,
            before: index,
        };
        self.branches[&branch].frames()[index].undo_commands(&history)
    }

    fn redo_frame(&self, branch: BranchId, index: usize) -> RestoreCommands {
        self.branches[&branch].frames()[index].redo_commands()
    }

    /// Serializes the whole stack: the branch hierarchy table first,
    /// then each branch's frame history in creation order, so a
    /// parent branch is always written before its children.
    pub fn save(&self) -> Vec<u8> {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_STACK, STACK_CHUNK_VERSION, |w| {
            w.write_u32(self.branches.len() as u32);
            for (id, branch) in &self.branches {
                w.write_u32(*id);
                w.write_u32(branch.parent().map_or(MASTER_BRANCH, |link| link.branch));
            }
            w.write_u32(self.branches.len() as u32);
            for (id, branch) in &self.branches {
                w.write_u32(*id);
                branch.encode(w);
            }
        });
        writer.into_bytes()
    }

    /// Reconstructs a stack from [`save`](StateStack::save) output.
    /// Branch records with stale versions are skipped with a warning;
    /// a missing parent branch is a hard error.
    pub fn load(scene: Arc<dyn SceneProvider>, bytes: &[u8]) -> Result<StateStack> {
        let chunk = ChunkReader::new(bytes)
            .read_chunk()
            .context("unable to parse state stack data")?
            .expect(CHUNK_STACK)?;
        let mut stack = StateStack::new(scene);
        if chunk.version != STACK_CHUNK_VERSION {
            warn!(
                "ignoring state stack data with unsupported version {}",
                chunk.version
            );
            return Ok(stack);
        }

        let mut reader = chunk.reader();
        let pair_count = reader.read_u32("branch hierarchy count")?;
        let mut parents: BTreeMap<BranchId, BranchId> = BTreeMap::new();
        for _ in 0..pair_count {
            let id = reader.read_u32("branch id")?;
            let parent = reader.read_u32("parent branch id")?;
            if id != MASTER_BRANCH {
                parents.insert(id, parent);
            }
        }

        let branch_count = reader.read_u32("branch count")?;
        for _ in 0..branch_count {
            let id = reader.read_u32("branch id")?;
            let branch_chunk = reader
                .read_chunk()
                .with_context(|| format!("unable to read data of branch {id}"))?;
            let parent_branch = if id == MASTER_BRANCH {
                None
            } else {
                let parent = *parents
                    .get(&id)
                    .ok_or_else(|| anyhow!("branch {id} is missing from the hierarchy table"))?;
                if !stack.branches.contains_key(&parent) {
                    return Err(anyhow!(
                        "parent branch {parent} of branch {id} appears after its child"
                    ));
                }
                Some(parent)
            };
            let branch = Branch::decode(id, parent_branch, branch_chunk)?;
            if let Some(link) = branch.parent() {
                if let Some(parent) = stack.branches.get_mut(&link.branch) {
                    parent.add_child(id);
                }
            }
            stack.branches.insert(id, branch);
            stack.next_branch_id = stack.next_branch_id.max(id + 1);
        }

        stack.applied = StackPos {
            branch: MASTER_BRANCH,
            cursor: stack.branches[&MASTER_BRANCH].cursor(),
        };
        Ok(stack)
    }
}

/// History lookup rooted just before a given frame of a branch.
struct HistoryView<'a> {
    stack: &'a StateStack,
    branch: BranchId,
    before: usize,
}

impl HistoryLookup for HistoryView<'_> {
    fn most_recent_snapshot(&self, id: NodeId) -> Option<Snapshot> {
        self.stack
            .find_most_recent_snapshot(self.branch, self.before, id)
    }

    fn most_recent_parent(&self, id: NodeId) -> Option<Option<NodeId>> {
        self.stack
            .find_most_recent_parent(self.branch, self.before, id)
    }
}
