use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::error::{GraphsyncError, Result};
use crate::extension::{find_extension, has_unique_names, ExtensionData};
use crate::link::Link;
use crate::networking::metadata::{Metadata, METADATA_EXTENSION};
use crate::node::{bincode_options, Node};

pub type RequestId = i32;
pub type Priority = i32;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    RequestAcknowledged,
    PartialResponse,
    RequestCompletedFull,
    RequestCompletedPartial,
    RequestFailed(String),
    RequestCancelled,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ResponseStatus::RequestAcknowledged | ResponseStatus::PartialResponse
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResponseStatus::RequestCompletedFull | ResponseStatus::RequestCompletedPartial
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphSyncRequest {
    id: RequestId,
    root: Link,
    #[serde(with = "serde_bytes")]
    selector: Vec<u8>,
    priority: Priority,
    extensions: Vec<ExtensionData>,
    cancel: bool,
}

impl GraphSyncRequest {
    pub fn new(
        id: RequestId,
        root: Link,
        selector: &Node,
        priority: Priority,
        extensions: Vec<ExtensionData>,
    ) -> Result<Self> {
        Ok(GraphSyncRequest {
            id,
            root,
            selector: selector.encode()?,
            priority,
            extensions,
            cancel: false,
        })
    }

    /// A record asking the responder to stop serving `id`.
    pub fn cancel(id: RequestId) -> Self {
        GraphSyncRequest {
            id,
            root: Link::default(),
            selector: vec![],
            priority: 0,
            extensions: vec![],
            cancel: true,
        }
    }

    pub fn get_id(&self) -> RequestId {
        self.id
    }

    pub fn get_root(&self) -> &Link {
        &self.root
    }

    pub fn get_selector(&self) -> &[u8] {
        &self.selector
    }

    pub fn get_priority(&self) -> Priority {
        self.priority
    }

    pub fn get_extensions(&self) -> &[ExtensionData] {
        &self.extensions
    }

    pub fn is_cancel(&self) -> bool {
        self.cancel
    }

    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        find_extension(&self.extensions, name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphSyncResponse {
    id: RequestId,
    status: ResponseStatus,
    extensions: Vec<ExtensionData>,
}

impl GraphSyncResponse {
    pub fn new(id: RequestId, status: ResponseStatus, extensions: Vec<ExtensionData>) -> Self {
        GraphSyncResponse {
            id,
            status,
            extensions,
        }
    }

    pub fn get_id(&self) -> RequestId {
        self.id
    }

    pub fn get_status(&self) -> &ResponseStatus {
        &self.status
    }

    pub fn get_extensions(&self) -> &[ExtensionData] {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Vec<ExtensionData> {
        &mut self.extensions
    }

    pub fn set_status(&mut self, status: ResponseStatus) {
        self.status = status;
    }

    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        find_extension(&self.extensions, name)
    }

    /// The response metadata, if the responder attached any.
    pub fn metadata(&self) -> Result<Option<Metadata>> {
        match self.extension(METADATA_EXTENSION) {
            Some(data) => Ok(Some(Metadata::decode(data)?)),
            None => Ok(None),
        }
    }
}

/// One wire frame. Blocks are matched to requests by link, not by position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GraphSyncMessage {
    requests: Vec<GraphSyncRequest>,
    responses: Vec<GraphSyncResponse>,
    blocks: Vec<Block>,
}

impl GraphSyncMessage {
    pub fn new(
        requests: Vec<GraphSyncRequest>,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> Self {
        GraphSyncMessage {
            requests,
            responses,
            blocks,
        }
    }

    pub fn get_requests(&self) -> &[GraphSyncRequest] {
        &self.requests
    }

    pub fn get_responses(&self) -> &[GraphSyncResponse] {
        &self.responses
    }

    pub fn get_blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_parts(self) -> (Vec<GraphSyncRequest>, Vec<GraphSyncResponse>, Vec<Block>) {
        (self.requests, self.responses, self.blocks)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.blocks.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode_options().serialize(self)?)
    }

    /// Decodes a frame of at most `limit` bytes and checks it: extension
    /// names are unique per record and every block matches its link.
    pub fn decode(bytes: &[u8], limit: u64) -> Result<Self> {
        let message: GraphSyncMessage = bincode_options()
            .with_limit(limit)
            .deserialize(bytes)
            .map_err(|err| GraphsyncError::Decode(format!("malformed message: {}", err)))?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<()> {
        for request in &self.requests {
            if !has_unique_names(&request.extensions) {
                return Err(GraphsyncError::Protocol(format!(
                    "request {} repeats an extension name",
                    request.id
                )));
            }
        }
        for response in &self.responses {
            if !has_unique_names(&response.extensions) {
                return Err(GraphsyncError::Protocol(format!(
                    "response {} repeats an extension name",
                    response.id
                )));
            }
        }
        for block in &self.blocks {
            if !block.verify() {
                return Err(GraphsyncError::Protocol(format!(
                    "block does not match link {}",
                    block.get_link()
                )));
            }
        }
        Ok(())
    }
}

/// Encoded size of any wire item, used to pack frames.
pub fn encoded_size<T: Serialize>(item: &T) -> usize {
    bincode_options().serialized_size(item).unwrap_or(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectorSpecBuilder;

    fn message() -> GraphSyncMessage {
        let selector = SelectorSpecBuilder::new().matcher();
        let request = GraphSyncRequest::new(
            7,
            Link::for_bytes(b"root"),
            &selector,
            3,
            vec![ExtensionData::new("app/hello", vec![1, 2])],
        )
        .unwrap();
        let response = GraphSyncResponse::new(4, ResponseStatus::PartialResponse, vec![]);
        GraphSyncMessage::new(
            vec![request, GraphSyncRequest::cancel(8)],
            vec![response],
            vec![Block::new(vec![5; 100])],
        )
    }

    #[test]
    fn message_survives_the_wire() {
        let message = message();
        let bytes = message.encode().unwrap();
        assert_eq!(encoded_size(&message), bytes.len());
        let decoded = GraphSyncMessage::decode(&bytes, 1 << 20).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.get_requests()[0].extension("app/hello"), Some(&[1u8, 2][..]));
        assert!(decoded.get_requests()[1].is_cancel());
        assert!(GraphSyncMessage::decode(&bytes, 16).is_err());
    }

    #[test]
    fn decode_rejects_forged_blocks_and_duplicate_names() {
        let forged = GraphSyncMessage::new(
            vec![],
            vec![],
            vec![Block::with_link(Link::for_bytes(b"x"), vec![1])],
        );
        let bytes = forged.encode().unwrap();
        assert!(matches!(
            GraphSyncMessage::decode(&bytes, 1 << 20),
            Err(GraphsyncError::Protocol(_))
        ));

        let duplicated = GraphSyncMessage::new(
            vec![],
            vec![GraphSyncResponse::new(
                1,
                ResponseStatus::RequestCompletedFull,
                vec![ExtensionData::new("a", vec![]), ExtensionData::new("a", vec![1])],
            )],
            vec![],
        );
        assert!(duplicated.validate().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ResponseStatus::PartialResponse.is_terminal());
        assert!(!ResponseStatus::RequestAcknowledged.is_terminal());
        assert!(ResponseStatus::RequestFailed(String::from("no")).is_terminal());
        assert!(ResponseStatus::RequestCompletedPartial.is_success());
        assert!(!ResponseStatus::RequestCancelled.is_success());
    }
}
