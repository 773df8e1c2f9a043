use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{GraphsyncError, Result};
use crate::extension::ExtensionData;
use crate::link::Link;
use crate::node::bincode_options;

/// Name of the extension carrying `Metadata` on responses.
pub const METADATA_EXTENSION: &str = "graphsync/response-metadata";

/// Whether the responder sent the block for a link its traversal needed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkMetadata {
    pub link: Link,
    pub block_present: bool,
}

/// The links a responder's traversal needed since its previous update, in
/// the order it needed them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    entries: Vec<LinkMetadata>,
}

impl Metadata {
    pub fn new(entries: Vec<LinkMetadata>) -> Self {
        Metadata { entries }
    }

    pub fn push(&mut self, link: Link, block_present: bool) {
        self.entries.push(LinkMetadata {
            link,
            block_present,
        });
    }

    pub fn append(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[LinkMetadata] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Links the responder reported it does not have.
    pub fn missing(&self) -> impl Iterator<Item = &Link> {
        self.entries
            .iter()
            .filter(|entry| !entry.block_present)
            .map(|entry| &entry.link)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode_options().serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode_options()
            .deserialize(data)
            .map_err(|err| GraphsyncError::Decode(format!("malformed response metadata: {}", err)))
    }

    pub fn to_extension(&self) -> Result<ExtensionData> {
        Ok(ExtensionData::new(METADATA_EXTENSION, self.encode()?))
    }
}
