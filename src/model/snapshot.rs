use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{generate_id, BlockNode, CanvasState, Connection, Id, Instance};

/// Payload layout written by this build. Payloads with a higher version were
/// written by a newer engine and are refused rather than half-read.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Data structure for the content stored in a snapshot's binary payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub format_version: u32,
    pub blocks: Vec<BlockNode>,
    pub connections: Vec<Connection>,
    pub canvas: CanvasState,
}

/// An immutable, named capture of an instance's graph and canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Id,
    pub instance_id: Id,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: Id,
    pub created_at: DateTime<Utc>,
    /// Instance revision the capture was taken at
    pub instance_revision: u64,
    pub block_count: i32,
    pub connection_count: i32,
    /// SHA-256 of the uncompressed payload
    pub checksum: String,
    /// Gzip-compressed JSON of [`SnapshotData`]
    pub payload: Vec<u8>,
    /// Uncompressed size for monitoring
    pub data_size: i64,
}

/// Snapshot metadata without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: Id,
    pub instance_id: Id,
    pub name: String,
    pub description: Option<String>,
    pub created_by: Id,
    pub created_at: DateTime<Utc>,
    pub instance_revision: u64,
    pub block_count: i32,
    pub connection_count: i32,
}

#[derive(Debug, Error)]
pub enum SnapshotDecodeError {
    #[error("payload could not be decompressed: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("checksum mismatch (expected {expected}, found {actual})")]
    Checksum { expected: String, actual: String },
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload could not be deserialized: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload format version {0} is newer than this build supports")]
    UnsupportedVersion(u32),
}

impl Snapshot {
    /// Deep-copy the instance's current graph and canvas into a new snapshot
    pub fn capture(
        instance: &Instance,
        name: String,
        description: Option<String>,
        created_by: Id,
    ) -> anyhow::Result<Self> {
        let data = SnapshotData {
            format_version: SNAPSHOT_FORMAT_VERSION,
            blocks: instance.blocks.clone(),
            connections: instance.connections.clone(),
            canvas: instance.canvas.clone(),
        };
        let serialized = serde_json::to_vec(&data)?;

        Ok(Self {
            id: generate_id(),
            instance_id: instance.id.clone(),
            name,
            description,
            created_by,
            created_at: Utc::now(),
            instance_revision: instance.revision,
            block_count: data.blocks.len() as i32,
            connection_count: data.connections.len() as i32,
            checksum: Self::calculate_checksum(&serialized),
            payload: Self::compress_data(&serialized)?,
            data_size: serialized.len() as i64,
        })
    }

    /// Calculate SHA-256 checksum of the uncompressed payload
    fn calculate_checksum(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compress data using gzip
    fn compress_data(data: &[u8]) -> std::io::Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    /// Decompress data from gzip
    fn decompress_data(data: &[u8]) -> std::io::Result<Vec<u8>> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        // Uncompressed payloads (no gzip magic bytes) are read as-is
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            let mut decoder = GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(decompressed)
        } else {
            Ok(data.to_vec())
        }
    }

    /// Decompress, verify and deserialize the payload
    pub fn get_data(&self) -> Result<SnapshotData, SnapshotDecodeError> {
        let decompressed = Self::decompress_data(&self.payload)?;

        let actual = Self::calculate_checksum(&decompressed);
        if actual != self.checksum {
            return Err(SnapshotDecodeError::Checksum {
                expected: self.checksum.clone(),
                actual,
            });
        }

        let json_str = String::from_utf8(decompressed)?;
        let data: SnapshotData = serde_json::from_str(&json_str)?;
        if data.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotDecodeError::UnsupportedVersion(data.format_version));
        }

        Ok(data)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            id: self.id.clone(),
            instance_id: self.instance_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            instance_revision: self.instance_revision,
            block_count: self.block_count,
            connection_count: self.connection_count,
        }
    }
}

/// Differences between two snapshots of the same instance, keyed by entity id
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub base_snapshot_id: Id,
    pub other_snapshot_id: Id,
    pub blocks_added: Vec<Id>,
    pub blocks_removed: Vec<Id>,
    /// Present in both with a different definition, config, position or label
    pub blocks_changed: Vec<Id>,
    pub connections_added: Vec<Id>,
    pub connections_removed: Vec<Id>,
    pub canvas_changed: bool,
}

impl SnapshotData {
    /// Compare two payloads and return the differences
    pub fn diff(base: &SnapshotData, other: &SnapshotData) -> SnapshotDiff {
        let base_blocks: HashMap<&str, &BlockNode> =
            base.blocks.iter().map(|b| (b.id.as_str(), b)).collect();
        let other_blocks: HashMap<&str, &BlockNode> =
            other.blocks.iter().map(|b| (b.id.as_str(), b)).collect();

        let mut diff = SnapshotDiff::default();

        for block in &other.blocks {
            match base_blocks.get(block.id.as_str()) {
                Some(previous) if *previous != block => diff.blocks_changed.push(block.id.clone()),
                Some(_) => {}
                None => diff.blocks_added.push(block.id.clone()),
            }
        }
        for block in &base.blocks {
            if !other_blocks.contains_key(block.id.as_str()) {
                diff.blocks_removed.push(block.id.clone());
            }
        }

        // An edge whose endpoints or ports changed counts as removed + added
        for connection in &other.connections {
            let kept = base
                .connections
                .iter()
                .any(|c| c.id == connection.id && c.same_edge(connection));
            if !kept {
                diff.connections_added.push(connection.id.clone());
            }
        }
        for connection in &base.connections {
            let kept = other
                .connections
                .iter()
                .any(|c| c.id == connection.id && c.same_edge(connection));
            if !kept {
                diff.connections_removed.push(connection.id.clone());
            }
        }

        diff.canvas_changed = base.canvas != other.canvas;
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Position;

    fn block(id: &str, x: f64) -> BlockNode {
        BlockNode {
            id: id.to_string(),
            definition_id: "def".to_string(),
            config: serde_json::Map::new(),
            position: Position::new(x, 0.0),
            label: None,
        }
    }

    fn instance_with_blocks() -> Instance {
        let mut instance = Instance::new("owner".to_string(), "Flow".to_string(), None);
        instance.blocks = vec![block("a", 0.0), block("b", 10.0)];
        instance.connections = vec![Connection {
            id: "c1".to_string(),
            source_id: "a".to_string(),
            source_port: "out".to_string(),
            target_id: "b".to_string(),
            target_port: "in".to_string(),
            config: None,
        }];
        instance.canvas = CanvasState(serde_json::json!({"zoom": 1.5}));
        instance
    }

    #[test]
    fn test_capture_round_trips_payload() {
        let instance = instance_with_blocks();
        let snapshot =
            Snapshot::capture(&instance, "v1".to_string(), None, "owner".to_string()).unwrap();

        assert_eq!(snapshot.block_count, 2);
        assert_eq!(snapshot.connection_count, 1);
        // gzip magic bytes
        assert_eq!(&snapshot.payload[..2], &[0x1f, 0x8b]);

        let data = snapshot.get_data().unwrap();
        assert_eq!(data.blocks, instance.blocks);
        assert_eq!(data.connections, instance.connections);
        assert_eq!(data.canvas, instance.canvas);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let instance = instance_with_blocks();
        let mut snapshot =
            Snapshot::capture(&instance, "v1".to_string(), None, "owner".to_string()).unwrap();

        snapshot.payload = b"{\"format_version\":1,\"blocks\":[]}".to_vec();
        assert!(matches!(
            snapshot.get_data(),
            Err(SnapshotDecodeError::Checksum { .. })
        ));

        snapshot.payload = vec![0x1f, 0x8b, 0x00, 0x01];
        assert!(matches!(
            snapshot.get_data(),
            Err(SnapshotDecodeError::Decompress(_))
        ));
    }

    #[test]
    fn test_newer_format_version_is_refused() {
        let data = serde_json::to_vec(&serde_json::json!({
            "format_version": SNAPSHOT_FORMAT_VERSION + 1,
            "blocks": [],
            "connections": [],
            "canvas": {}
        }))
        .unwrap();
        let instance = instance_with_blocks();
        let mut snapshot =
            Snapshot::capture(&instance, "v1".to_string(), None, "owner".to_string()).unwrap();
        snapshot.checksum = Snapshot::calculate_checksum(&data);
        snapshot.payload = data;

        assert!(matches!(
            snapshot.get_data(),
            Err(SnapshotDecodeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_diff_reports_added_removed_and_changed() {
        let base = SnapshotData {
            format_version: 1,
            blocks: vec![block("a", 0.0), block("b", 10.0)],
            connections: instance_with_blocks().connections,
            canvas: CanvasState::default(),
        };
        let other = SnapshotData {
            format_version: 1,
            blocks: vec![block("a", 5.0), block("c", 20.0)],
            connections: Vec::new(),
            canvas: CanvasState::default(),
        };

        let diff = SnapshotData::diff(&base, &other);
        assert_eq!(diff.blocks_added, vec!["c".to_string()]);
        assert_eq!(diff.blocks_removed, vec!["b".to_string()]);
        assert_eq!(diff.blocks_changed, vec!["a".to_string()]);
        assert_eq!(diff.connections_removed, vec!["c1".to_string()]);
        assert!(diff.connections_added.is_empty());
        assert!(!diff.canvas_changed);
    }
}
