use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkReader, ChunkTag, ChunkWriter, CHUNK_NODE};

/// Process-unique identifier of a scene node. Zero is never assigned
/// to a node; on the wire it encodes "no parent".
pub type NodeId = u64;

const NODE_CHUNK_VERSION: u32 = 1;

/// A node of the live scene graph.
///
/// The id and the parent link are structural and owned by the scene
/// container; everything else is content that travels through node
/// snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    id: NodeId,
    pub name: String,
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub enabled: bool,
    pub(crate) parent: Option<NodeId>,
    pub(crate) world_transform: Mat4,
}

/// Content fields of a node as stored in a `NODE` chunk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeRecord {
    name: String,
    position: Vec3,
    rotation: Vec3,
    scale: Vec3,
    enabled: bool,
}

impl SceneNode {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            enabled: true,
            parent: None,
            world_transform: Mat4::IDENTITY,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// World transform as of the last transform-resolution pass.
    pub fn world_transform(&self) -> Mat4 {
        self.world_transform
    }

    /// Local transform composed from position, rotation (degrees,
    /// applied Z then Y then X) and scale.
    pub fn local_transform(&self) -> Mat4 {
        let rotation = Mat4::from_rotation_z(self.rotation.z.to_radians())
            * Mat4::from_rotation_y(self.rotation.y.to_radians())
            * Mat4::from_rotation_x(self.rotation.x.to_radians());
        Mat4::from_translation(self.position) * rotation * Mat4::from_scale(self.scale)
    }

    /// Serializes the node's full content into a `NODE` chunk.
    pub fn encode_snapshot(&self) -> Result<Vec<u8>> {
        let record = NodeRecord {
            name: self.name.clone(),
            position: self.position,
            rotation: self.rotation,
            scale: self.scale,
            enabled: self.enabled,
        };
        let payload = bincode::serialize(&record).context("unable to encode node record")?;
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_NODE, NODE_CHUNK_VERSION, |w| {
            w.write_bytes(&payload);
        });
        Ok(writer.into_bytes())
    }

    /// Overwrites the node's content from a snapshot produced by
    /// [`encode_snapshot`]. Structural fields (id, parent) are left
    /// untouched. A snapshot with an unrecognised version is logged
    /// and ignored so stale data cannot corrupt a live node.
    ///
    /// [`encode_snapshot`]: SceneNode::encode_snapshot
    pub fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let chunk = ChunkReader::new(bytes)
            .read_chunk()
            .context("unable to parse node snapshot")?
            .expect(CHUNK_NODE)?;
        if chunk.version != NODE_CHUNK_VERSION {
            warn!(
                "skipping node snapshot for {} with unsupported version {} (chunk {})",
                self.id,
                chunk.version,
                ChunkTag(chunk.id)
            );
            return Ok(());
        }
        let record: NodeRecord =
            bincode::deserialize(chunk.payload).context("unable to decode node record")?;
        self.name = record.name;
        self.position = record.position;
        self.rotation = record.rotation;
        self.scale = record.scale;
        self.enabled = record.enabled;
        Ok(())
    }

    /// Reconstructs a node with the given id from a snapshot.
    pub fn from_snapshot(id: NodeId, bytes: &[u8]) -> Result<Self> {
        let mut node = Self::new(id, String::new());
        node.apply_snapshot(bytes)?;
        Ok(node)
    }
}

/// Live scene access required by the state stack layer.
///
/// The stack never inspects node contents; it only needs identity and
/// parent lookups plus the snapshot codec and structural mutation.
/// Implementations are expected to tolerate unknown ids silently.
pub trait SceneProvider: Send + Sync {
    fn contains_node(&self, id: NodeId) -> bool;

    /// Current parent of the node, `None` for root nodes and for
    /// unknown ids alike.
    fn node_parent(&self, id: NodeId) -> Option<NodeId>;

    /// Serializes the node's full state to an opaque buffer.
    fn serialize_node(&self, id: NodeId) -> Result<Vec<u8>>;

    /// Deserializes a snapshot into an existing node. Unknown ids are
    /// ignored.
    fn apply_node_snapshot(&self, id: NodeId, bytes: &[u8]) -> Result<()>;

    /// Recreates a node from a snapshot, overwriting the content of
    /// any node already registered under the id.
    fn restore_node(&self, id: NodeId, bytes: &[u8]) -> Result<()>;

    /// Deletes the node. Unknown ids are ignored.
    fn delete_node(&self, id: NodeId);

    /// Re-parents the node. Unknown ids are ignored.
    fn set_node_parent(&self, id: NodeId, parent: Option<NodeId>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::fourcc;

    fn sample_node() -> SceneNode {
        let mut node = SceneNode::new(42, "Crate");
        node.position = Vec3::new(1.0, 2.0, 3.0);
        node.rotation = Vec3::new(0.0, 90.0, 0.0);
        node.scale = Vec3::splat(2.0);
        node.enabled = false;
        node
    }

    #[test]
    fn snapshot_round_trip_preserves_content() {
        let node = sample_node();
        let bytes = node.encode_snapshot().unwrap();
        let restored = SceneNode::from_snapshot(42, &bytes).unwrap();
        assert_eq!(restored, node);
    }

    #[test]
    fn apply_snapshot_keeps_structural_fields() {
        let source = sample_node();
        let bytes = source.encode_snapshot().unwrap();

        let mut target = SceneNode::new(7, "Old");
        target.parent = Some(99);
        target.apply_snapshot(&bytes).unwrap();

        assert_eq!(target.id(), 7);
        assert_eq!(target.parent(), Some(99));
        assert_eq!(target.name, "Crate");
        assert_eq!(target.position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn stale_snapshot_version_is_ignored() {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_NODE, 999, |w| w.write_bytes(&[1, 2, 3]));
        let bytes = writer.into_bytes();

        let mut node = sample_node();
        let before = node.clone();
        node.apply_snapshot(&bytes).unwrap();
        assert_eq!(node, before);
    }

    #[test]
    fn foreign_chunk_id_is_an_error() {
        let mut writer = ChunkWriter::new();
        writer.chunk(fourcc(b"MESH"), 1, |w| w.write_bytes(&[0]));
        let bytes = writer.into_bytes();

        let mut node = sample_node();
        assert!(node.apply_snapshot(&bytes).is_err());
    }

    #[test]
    fn local_transform_applies_translation() {
        let mut node = SceneNode::new(1, "Probe");
        node.position = Vec3::new(5.0, 0.0, 0.0);
        let moved = node.local_transform().transform_point3(Vec3::ZERO);
        assert!((moved - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);
    }
}
