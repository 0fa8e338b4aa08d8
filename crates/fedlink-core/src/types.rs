use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::run_status;
use crate::error::CoreError;

/// Coordinator-assigned identity for one participant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Execution context scoping the messages and objects of one federated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

/// 32-byte content address (`hash(object_bytes)`).
///
/// Equal content always yields an equal id, which is what lets peers skip
/// objects they already hold.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 32]);

impl ObjectId {
    /// Lowercase hex rendering used in logs and on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| CoreError::Decode("object id is not hex"))?;
        if raw.len() != 32 {
            return Err(CoreError::InvalidInput("object id must be 32 bytes"));
        }
        let mut bytes = [0_u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// Lifecycle status of a run as reported by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// One of [`crate::constants::run_status`].
    pub status: String,
    /// Empty until the run is finished.
    pub sub_status: String,
    /// Free-form failure details.
    pub details: String,
}

/// Run descriptor. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub fab_id: String,
    pub fab_version: String,
    pub fab_hash: String,
    pub override_config: BTreeMap<String, String>,
    pub status: RunStatus,
}

impl Run {
    /// Minimal running descriptor with no application bundle metadata.
    pub fn with_id(run_id: RunId) -> Self {
        Self {
            run_id,
            fab_id: String::new(),
            fab_version: String::new(),
            fab_hash: String::new(),
            override_config: BTreeMap::new(),
            status: RunStatus {
                status: run_status::RUNNING.to_string(),
                ..RunStatus::default()
            },
        }
    }
}

/// Application bundle fetched for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fab {
    pub hash_str: String,
    pub content: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::{ObjectId, Run, RunId};
    use crate::constants::run_status;

    #[test]
    fn object_id_hex_round_trips_through_from_str() {
        let id = ObjectId([0xAB; 32]);
        let parsed: ObjectId = id.to_hex().parse().expect("hex id should parse");
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 64);
    }

    #[test]
    fn minimal_run_is_running() {
        let run = Run::with_id(RunId(3));
        assert_eq!(run.status.status, run_status::RUNNING);
        assert!(run.status.sub_status.is_empty());
    }

    #[test]
    fn object_id_rejects_wrong_length_and_non_hex() {
        assert!("abcd".parse::<ObjectId>().is_err());
        assert!("zz".repeat(32).parse::<ObjectId>().is_err());
    }
}
