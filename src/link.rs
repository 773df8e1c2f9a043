use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash, GraphsyncHash};

/// A content identifier for a block: the blake3 digest of its encoded bytes.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Link(GraphsyncHash);

impl Link {
    pub fn new(digest: GraphsyncHash) -> Self {
        Link(digest)
    }

    /// Computes the link that addresses `data`.
    pub fn for_bytes(data: &[u8]) -> Self {
        Link(hash(data))
    }

    pub fn digest(&self) -> &GraphsyncHash {
        &self.0
    }

    /// Whether `data` is the block this link addresses.
    pub fn verifies(&self, data: &[u8]) -> bool {
        hash(data) == self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_verifies_its_own_bytes() {
        let data = b"some block".to_vec();
        let link = Link::for_bytes(&data);
        assert!(link.verifies(&data));
        assert!(!link.verifies(b"another block"));
        assert_eq!(link.to_hex().len(), 64);
    }
}
