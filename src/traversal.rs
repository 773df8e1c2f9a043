use std::collections::VecDeque;

use tracing::{event, Level};

use crate::error::{GraphsyncError, Result};
use crate::link::Link;
use crate::node::Node;
use crate::path::{Path, PathSegment};
use crate::selector::Selector;

/// The most recent block a traversal had to load to reach a node.
#[derive(Debug, Clone, PartialEq)]
pub struct LastBlock {
    pub path: Path,
    pub link: Link,
}

/// One visited node, in depth-first visitation order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseProgress {
    pub node: Node,
    pub path: Path,
    pub last_block: Option<LastBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraversalOutcome {
    CompletedFull,
    /// Some non-root links could not be loaded; their branches were skipped.
    CompletedPartial { missing: Vec<Link> },
    Failed(GraphsyncError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraversalStep {
    Progress(ResponseProgress),
    /// The traversal is suspended until `load` is called for this link.
    NeedLink(Link),
    Done(TraversalOutcome),
}

struct Frame {
    node: Node,
    selector: Selector,
    path: Path,
    last_block: Option<LastBlock>,
    // set when the frame's node was loaded from a block
    link: Option<Link>,
    children: VecDeque<PathSegment>,
}

struct PendingLoad {
    link: Link,
    selector: Selector,
    path: Path,
}

/// A depth-first selector traversal driven by its owner.
///
/// Call `advance` until it returns `Done`. Whenever it returns `NeedLink`
/// the owner fetches the block and hands the result to `load`; calling
/// `advance` again without loading repeats the same `NeedLink`.
pub struct Traverser {
    stack: Vec<Frame>,
    pending: Option<PendingLoad>,
    ready: Option<ResponseProgress>,
    missing: Vec<Link>,
    outcome: Option<TraversalOutcome>,
}

impl Traverser {
    pub fn new(root: Link, selector: Selector) -> Self {
        Traverser {
            stack: vec![],
            pending: Some(PendingLoad {
                link: root,
                selector,
                path: Path::new(),
            }),
            ready: None,
            missing: vec![],
            outcome: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// Links that were reported missing so far.
    pub fn missing(&self) -> &[Link] {
        &self.missing
    }

    pub fn advance(&mut self) -> TraversalStep {
        if let Some(outcome) = &self.outcome {
            return TraversalStep::Done(outcome.clone());
        }
        if let Some(progress) = self.ready.take() {
            return TraversalStep::Progress(progress);
        }
        if let Some(pending) = &self.pending {
            return TraversalStep::NeedLink(pending.link);
        }

        loop {
            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => return self.finish(),
            };
            let segment = match frame.children.pop_front() {
                Some(segment) => segment,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            let child = match frame.node.lookup(&segment) {
                Some(child) => child.clone(),
                None => continue,
            };
            let selector = match frame.selector.explore(&frame.node, &segment) {
                Some(selector) => selector,
                None => continue,
            };
            let path = frame.path.append(segment);
            let last_block = frame.last_block.clone();

            if let Node::Link(link) = child {
                if self.stack.iter().any(|frame| frame.link == Some(link)) {
                    event!(Level::DEBUG, "skipping cyclic link {} at {}", link, path);
                    continue;
                }
                self.pending = Some(PendingLoad {
                    link,
                    selector,
                    path,
                });
                return TraversalStep::NeedLink(link);
            }

            return TraversalStep::Progress(self.visit(child, selector, path, last_block, None));
        }
    }

    /// Resumes the traversal with the result of loading the requested link.
    ///
    /// `NotFound` prunes the branch (or fails the traversal at the root). The
    /// bytes must hash to the requested link and decode to a node.
    pub fn load(&mut self, result: Result<Vec<u8>>) {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => {
                event!(Level::WARN, "load called on a traversal that is not waiting");
                return;
            }
        };
        let is_root = self.stack.is_empty() && pending.path.is_empty();
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(GraphsyncError::NotFound(_)) if !is_root => {
                self.missing.push(pending.link);
                return;
            }
            Err(err) => {
                self.outcome = Some(TraversalOutcome::Failed(err));
                return;
            }
        };
        if !pending.link.verifies(&bytes) {
            self.outcome = Some(TraversalOutcome::Failed(GraphsyncError::Decode(format!(
                "block does not match link {}",
                pending.link
            ))));
            return;
        }
        match Node::decode(&bytes) {
            Ok(node) => {
                let last_block = Some(LastBlock {
                    path: pending.path.clone(),
                    link: pending.link,
                });
                let progress = self.visit(
                    node,
                    pending.selector,
                    pending.path,
                    last_block,
                    Some(pending.link),
                );
                self.ready = Some(progress);
            }
            Err(err) => self.outcome = Some(TraversalOutcome::Failed(err)),
        }
    }

    fn visit(
        &mut self,
        node: Node,
        selector: Selector,
        path: Path,
        last_block: Option<LastBlock>,
        link: Option<Link>,
    ) -> ResponseProgress {
        let progress = ResponseProgress {
            node: node.clone(),
            path: path.clone(),
            last_block: last_block.clone(),
        };
        if node.is_recursive() {
            let children: VecDeque<PathSegment> = match selector.interests(&node) {
                None => node.entries().into_iter().map(|(segment, _)| segment).collect(),
                Some(segments) => segments.into_iter().collect(),
            };
            if !children.is_empty() {
                self.stack.push(Frame {
                    node,
                    selector,
                    path,
                    last_block,
                    link,
                    children,
                });
            }
        }
        progress
    }

    fn finish(&mut self) -> TraversalStep {
        let outcome = if self.missing.is_empty() {
            TraversalOutcome::CompletedFull
        } else {
            TraversalOutcome::CompletedPartial {
                missing: self.missing.clone(),
            }
        };
        self.outcome = Some(outcome.clone());
        TraversalStep::Done(outcome)
    }
}

/// Runs a traversal to completion against a synchronous loader.
pub fn walk<F>(root: Link, selector: Selector, mut loader: F) -> (Vec<ResponseProgress>, TraversalOutcome)
where
    F: FnMut(&Link) -> Result<Vec<u8>>,
{
    let mut traverser = Traverser::new(root, selector);
    let mut visited = vec![];
    loop {
        match traverser.advance() {
            TraversalStep::Progress(progress) => visited.push(progress),
            TraversalStep::NeedLink(link) => traverser.load(loader(&link)),
            TraversalStep::Done(outcome) => return (visited, outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::selector::{RecursionLimit, SelectorSpecBuilder};
    use ahash::AHashMap;

    struct Chain {
        blocks: AHashMap<Link, Vec<u8>>,
        tip: Link,
        links: Vec<Link>,
    }

    // genesis first; each block links to its predecessor
    fn chain(length: usize) -> Chain {
        let mut blocks = AHashMap::new();
        let mut links = vec![];
        let mut parents = vec![];
        for i in 0..length {
            let node = Node::map(vec![
                ("Parents", Node::List(parents.clone())),
                ("Messages", Node::list(vec![Node::Int(i as i64)])),
            ]);
            let block = Block::from_node(&node).unwrap();
            parents = vec![Node::Link(*block.get_link())];
            links.push(*block.get_link());
            blocks.insert(*block.get_link(), block.into_data());
        }
        Chain {
            tip: *links.last().unwrap(),
            blocks,
            links,
        }
    }

    fn parents_selector(limit: RecursionLimit) -> Selector {
        let builder = SelectorSpecBuilder::new();
        Selector::parse(&builder.explore_recursive(
            limit,
            builder.explore_fields(vec![(
                "Parents",
                builder.explore_all(builder.explore_recursive_edge()),
            )]),
        ))
        .unwrap()
    }

    fn loader<'a>(chain: &'a Chain) -> impl FnMut(&Link) -> Result<Vec<u8>> + 'a {
        move |link| {
            chain
                .blocks
                .get(link)
                .cloned()
                .ok_or(GraphsyncError::NotFound(*link))
        }
    }

    #[test]
    fn blockchain_visits_two_nodes_per_block() {
        let chain = chain(10);
        let (visited, outcome) = walk(chain.tip, parents_selector(RecursionLimit::None), loader(&chain));
        assert_eq!(outcome, TraversalOutcome::CompletedFull);
        assert_eq!(visited.len(), 20);
        let mut expected = String::new();
        for (i, progress) in visited.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(progress.path.to_string(), expected);
                assert!(progress.node.as_map().is_some());
                let last_block = progress.last_block.as_ref().unwrap();
                assert_eq!(last_block.path, progress.path);
                assert_eq!(last_block.link, chain.links[chain.links.len() - 1 - i / 2]);
                if expected.is_empty() {
                    expected = String::from("Parents");
                } else {
                    expected = format!("{}/Parents", expected);
                }
            } else {
                assert_eq!(progress.path.to_string(), expected);
                assert!(progress.node.as_list().is_some());
                expected = format!("{}/0", expected);
            }
        }
    }

    #[test]
    fn depth_limit_bounds_the_walk() {
        let chain = chain(10);
        let (visited, outcome) = walk(chain.tip, parents_selector(RecursionLimit::Depth(4)), loader(&chain));
        assert_eq!(outcome, TraversalOutcome::CompletedFull);
        assert_eq!(visited.len(), 8);
    }

    #[test]
    fn missing_branch_completes_partial() {
        let mut chain = chain(6);
        let removed = chain.links[2];
        chain.blocks.remove(&removed);
        let (visited, outcome) = walk(chain.tip, parents_selector(RecursionLimit::None), loader(&chain));
        assert_eq!(
            outcome,
            TraversalOutcome::CompletedPartial {
                missing: vec![removed]
            }
        );
        assert_eq!(visited.len(), 6);
    }

    #[test]
    fn missing_root_fails() {
        let chain = chain(2);
        let absent = Link::for_bytes(b"absent");
        let (visited, outcome) = walk(absent, parents_selector(RecursionLimit::None), loader(&chain));
        assert!(visited.is_empty());
        assert_eq!(outcome, TraversalOutcome::Failed(GraphsyncError::NotFound(absent)));
    }

    #[test]
    fn corrupt_block_aborts() {
        let mut chain = chain(3);
        chain.blocks.insert(chain.links[1], vec![1, 2, 3]);
        let (visited, outcome) = walk(chain.tip, parents_selector(RecursionLimit::None), loader(&chain));
        assert_eq!(visited.len(), 2);
        assert!(matches!(outcome, TraversalOutcome::Failed(GraphsyncError::Decode(_))));
    }

    #[test]
    fn suspends_until_loaded() {
        let chain = chain(2);
        let mut traverser = Traverser::new(chain.tip, parents_selector(RecursionLimit::None));
        assert_eq!(traverser.advance(), TraversalStep::NeedLink(chain.tip));
        assert_eq!(traverser.advance(), TraversalStep::NeedLink(chain.tip));
        traverser.load(Ok(chain.blocks[&chain.tip].clone()));
        match traverser.advance() {
            TraversalStep::Progress(progress) => assert!(progress.path.is_empty()),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(!traverser.is_done());
    }

    #[test]
    fn huge_range_walks_only_existing_children() {
        let builder = SelectorSpecBuilder::new();
        let selector = Selector::parse(&builder.explore_fields(vec![(
            "Parents",
            builder.explore_range(0, 1 << 40, builder.matcher()),
        )]))
        .unwrap();
        let root = Block::from_node(&Node::map(vec![(
            "Parents",
            Node::list(vec![Node::Int(1), Node::Int(2)]),
        )]))
        .unwrap();
        let (visited, outcome) = walk(*root.get_link(), selector, |_| Ok(root.get_data().to_vec()));
        assert_eq!(outcome, TraversalOutcome::CompletedFull);
        let paths: Vec<String> = visited.iter().map(|progress| progress.path.to_string()).collect();
        assert_eq!(paths, vec!["", "Parents", "Parents/0", "Parents/1"]);
    }
}
