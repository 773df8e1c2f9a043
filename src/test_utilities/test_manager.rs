use std::time::Duration;

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::block::Block;
use crate::error::{GraphsyncError, Result};
use crate::link::Link;
use crate::node::Node;
use crate::selector::{RecursionLimit, SelectorSpecBuilder};
use crate::storage::BlockStore;
use crate::stream::{ErrorStream, ResponseProgressStream};
use crate::traversal::ResponseProgress;

/// How long a collector waits for a stream before failing the test.
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Deterministic payloads. Each fixture gets its own generator, so two
/// setups with the same seed produce the same DAG.
pub struct RandomBytes {
    rng: StdRng,
}

impl RandomBytes {
    pub fn new(seed: u64) -> Self {
        RandomBytes {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn bytes(&mut self, size: usize) -> Vec<u8> {
        let mut data = vec![0; size];
        self.rng.fill_bytes(&mut data);
        data
    }
}

/// A chain of blocks in which every block lists its predecessor under
/// "Parents" and carries a random payload under "Messages".
#[derive(Debug, Clone)]
pub struct TestBlockChain {
    length: usize,
    pub genesis: Node,
    pub genesis_link: Link,
    pub middle_nodes: Vec<Node>,
    pub middle_links: Vec<Link>,
    pub tip: Node,
    pub tip_link: Link,
}

fn chain_block(parents: Vec<Node>, payload: Vec<u8>) -> Node {
    Node::map(vec![
        ("Parents", Node::List(parents)),
        ("Messages", Node::list(vec![Node::Bytes(payload)])),
    ])
}

impl TestBlockChain {
    /// Builds a chain of `length` blocks (at least two) with `block_size`
    /// bytes of payload each and writes every block to `store`.
    pub fn setup(
        store: &dyn BlockStore,
        random: &mut RandomBytes,
        block_size: usize,
        length: usize,
    ) -> Result<Self> {
        let genesis = chain_block(vec![], random.bytes(block_size));
        let genesis_link = store.put(genesis.encode()?)?;
        let mut parent = genesis_link;
        let mut middle_nodes = vec![];
        let mut middle_links = vec![];
        for _ in 0..length.saturating_sub(2) {
            let node = chain_block(vec![Node::Link(parent)], random.bytes(block_size));
            parent = store.put(node.encode()?)?;
            middle_nodes.push(node);
            middle_links.push(parent);
        }
        let tip = chain_block(vec![Node::Link(parent)], random.bytes(block_size));
        let tip_link = store.put(tip.encode()?)?;
        Ok(TestBlockChain {
            length,
            genesis,
            genesis_link,
            middle_nodes,
            middle_links,
            tip,
            tip_link,
        })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Follows "Parents" from the tip down to the genesis block.
    pub fn selector(&self) -> Node {
        blockchain_selector(RecursionLimit::Depth(self.length as u64))
    }

    /// The link `from_tip` blocks below the tip.
    pub fn link_tip_index(&self, from_tip: usize) -> Link {
        if from_tip == 0 {
            self.tip_link
        } else if from_tip >= self.length - 1 {
            self.genesis_link
        } else {
            self.middle_links[self.middle_links.len() - from_tip]
        }
    }

    pub fn node_tip_index(&self, from_tip: usize) -> &Node {
        if from_tip == 0 {
            &self.tip
        } else if from_tip >= self.length - 1 {
            &self.genesis
        } else {
            &self.middle_nodes[self.middle_nodes.len() - from_tip]
        }
    }

    /// Every block of the chain, tip first.
    pub fn blocks(&self) -> Result<Vec<Block>> {
        (0..self.length)
            .map(|from_tip| Block::from_node(self.node_tip_index(from_tip)))
            .collect()
    }

    pub fn verify_whole_chain(&self, responses: &[ResponseProgress]) {
        self.verify_response_range(responses, 0, self.length);
    }

    /// Checks that `responses` are exactly the visits of blocks `from..to`
    /// (counted from the tip): the block, then its "Parents" list.
    pub fn verify_response_range(&self, responses: &[ResponseProgress], from: usize, to: usize) {
        assert_eq!(responses.len(), (to - from) * 2, "unexpected response count");
        let mut expected_path = String::new();
        for i in 0..from {
            if i == 0 {
                expected_path = String::from("Parents");
            } else {
                expected_path.push_str("/Parents");
            }
            expected_path.push_str("/0");
        }
        for (i, response) in responses.iter().enumerate() {
            assert_eq!(response.path.to_string(), expected_path);
            if i % 2 == 0 {
                let last_block = response
                    .last_block
                    .as_ref()
                    .expect("block visit without a last block");
                assert_eq!(last_block.path, response.path);
                assert_eq!(last_block.link, self.link_tip_index(i / 2 + from));
                assert_eq!(&response.node, self.node_tip_index(i / 2 + from));
                if expected_path.is_empty() {
                    expected_path = String::from("Parents");
                } else {
                    expected_path.push_str("/Parents");
                }
            } else {
                assert!(response.node.as_list().is_some());
                expected_path.push_str("/0");
            }
        }
    }
}

/// A recursive explore of "Parents" with the given limit.
pub fn blockchain_selector(limit: RecursionLimit) -> Node {
    let builder = SelectorSpecBuilder::new();
    builder.explore_recursive(
        limit,
        builder.explore_fields(vec![(
            "Parents",
            builder.explore_all(builder.explore_recursive_edge()),
        )]),
    )
}

pub async fn collect_responses(responses: &mut ResponseProgressStream) -> Vec<ResponseProgress> {
    tokio::time::timeout(COLLECT_TIMEOUT, responses.collect::<Vec<ResponseProgress>>())
        .await
        .expect("response stream did not close")
}

pub async fn collect_errors(errors: &mut ErrorStream) -> Vec<GraphsyncError> {
    tokio::time::timeout(COLLECT_TIMEOUT, errors.collect::<Vec<GraphsyncError>>())
        .await
        .expect("error stream did not close")
}

pub async fn read_n_responses(
    responses: &mut ResponseProgressStream,
    count: usize,
) -> Vec<ResponseProgress> {
    let mut read = vec![];
    for _ in 0..count {
        let response = tokio::time::timeout(COLLECT_TIMEOUT, responses.next())
            .await
            .expect("timed out reading responses")
            .expect("response stream closed early");
        read.push(response);
    }
    read
}

/// Asserts the error stream yields exactly one error and closes.
pub async fn verify_single_terminal_error(errors: &mut ErrorStream) -> GraphsyncError {
    let mut collected = collect_errors(errors).await;
    assert_eq!(collected.len(), 1, "expected a single error, got {:?}", collected);
    collected.remove(0)
}

pub async fn verify_empty_errors(errors: &mut ErrorStream) {
    let collected = collect_errors(errors).await;
    assert!(collected.is_empty(), "unexpected errors {:?}", collected);
}

pub async fn verify_empty_response(responses: &mut ResponseProgressStream) {
    let collected = collect_responses(responses).await;
    assert!(collected.is_empty(), "unexpected responses {:?}", collected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::traversal::walk;

    #[test]
    fn fixture_is_deterministic_and_walkable() {
        let store = MemoryStore::new();
        let chain = TestBlockChain::setup(&store, &mut RandomBytes::new(7), 64, 12).unwrap();
        let again = TestBlockChain::setup(&MemoryStore::new(), &mut RandomBytes::new(7), 64, 12).unwrap();
        assert_eq!(chain.tip_link, again.tip_link);
        assert_eq!(store.len(), 12);
        assert_eq!(chain.blocks().unwrap().len(), 12);
        assert_eq!(chain.link_tip_index(11), chain.genesis_link);

        let selector = crate::selector::Selector::parse(&chain.selector()).unwrap();
        let (visited, _) = walk(chain.tip_link, selector, |link| store.get(link));
        chain.verify_whole_chain(&visited);
        chain.verify_response_range(&visited[4..], 2, 12);
    }
}
