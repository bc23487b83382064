//! Branching scene history for the Crystal runtime, rewritten in Rust.
//!
//! The crate implements a transactional, branchable undo/redo store
//! layered on top of a live mutable scene graph: edits are staged per
//! branch, committed into immutable frames, and replayed against the
//! scene when seeking through history or switching branches.
//! Rendering and platform integration are intentionally kept outside
//! of the crate so that the code remains testable and easy to embed
//! in headless tools.

pub mod branch;
pub mod chunk;
pub mod node;
pub mod scene_state;
pub mod snapshot;
pub mod stack;
pub mod staging;

pub use branch::{Branch, BranchId, BranchLink, Frame, MASTER_BRANCH};
pub use chunk::{ChunkError, ChunkReader, ChunkWriter};
pub use node::{NodeId, SceneNode, SceneProvider};
pub use scene_state::{NoopEvents, SceneEvents, SceneState};
pub use snapshot::{Snapshot, SnapshotMap};
pub use stack::StateStack;
pub use staging::{HistoryLookup, RestoreCommands, StagingArea};
