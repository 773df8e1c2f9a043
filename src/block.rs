use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::link::Link;
use crate::node::Node;

/// A raw block as it travels on the wire: the encoded bytes of one node and
/// the link claimed for them. The claim is checked before the bytes are used.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Block {
    link: Link,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl Block {
    /// Wraps bytes with the link computed from them.
    pub fn new(data: Vec<u8>) -> Self {
        Block {
            link: Link::for_bytes(&data),
            data,
        }
    }

    /// Pairs bytes with a link without checking them. Used when decoding frames;
    /// call `verify` before trusting the result.
    pub fn with_link(link: Link, data: Vec<u8>) -> Self {
        Block { link, data }
    }

    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(Block::new(node.encode()?))
    }

    pub fn get_link(&self) -> &Link {
        &self.link
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn verify(&self) -> bool {
        self.link.verifies(&self.data)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("link", &self.link)
            .field("len", &self.data.len())
            .finish()
    }
}
