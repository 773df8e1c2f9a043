use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{hash, GraphsyncHash};

/// Identifies a remote node to the transport.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(GraphsyncHash);

impl PeerId {
    pub fn new(id: GraphsyncHash) -> Self {
        PeerId(id)
    }

    /// A fresh, unpredictable id for a node that has no identity of its own.
    pub fn random() -> Self {
        PeerId(hash(Uuid::new_v4().as_bytes()))
    }

    /// A stable id derived from a label, for tests and demos.
    pub fn from_label(label: &str) -> Self {
        PeerId(hash(label.as_bytes()))
    }

    pub fn get_id(&self) -> &GraphsyncHash {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}
