//! Selectors describe which part of a DAG a traversal visits.
//!
//! A selector travels as a `Node` (see `SelectorSpecBuilder`) and is parsed
//! once into a `Selector`. The single-key map encoding follows the compact
//! IPLD selector form:
//!
//! | key   | selector             | body                                      |
//! |-------|----------------------|-------------------------------------------|
//! | `.`   | Matcher              | `{}`                                      |
//! | `a`   | ExploreAll           | `{">": next}`                             |
//! | `f`   | ExploreFields        | `{"f>": {name: next, ...}}`               |
//! | `i`   | ExploreIndex         | `{"i": index, ">": next}`                 |
//! | `r`   | ExploreRange         | `{"^": start, "$": end, ">": next}`       |
//! | `R`   | ExploreRecursive     | `{"l": {"depth": n} or {"none": {}}, ":>": sequence}` |
//! | `@`   | ExploreRecursiveEdge | `{}`                                      |
//! | `|`   | ExploreUnion         | `[selector, ...]`                         |
//!
//! Map fields are explored in key order because `Node::Map` is ordered.
pub mod builder;

use std::collections::BTreeMap;

use crate::error::{GraphsyncError, Result};
use crate::node::Node;
use crate::path::PathSegment;

pub use builder::SelectorSpecBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionLimit {
    None,
    Depth(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Matcher,
    ExploreAll {
        next: Box<Selector>,
    },
    ExploreFields {
        fields: BTreeMap<String, Selector>,
    },
    ExploreIndex {
        index: usize,
        next: Box<Selector>,
    },
    ExploreRange {
        start: usize,
        end: usize,
        next: Box<Selector>,
    },
    ExploreUnion(Vec<Selector>),
    ExploreRecursive {
        sequence: Box<Selector>,
        current: Box<Selector>,
        limit: RecursionLimit,
    },
    ExploreRecursiveEdge,
}

/// Deepest chain of nested selectors `Selector::parse` accepts.
pub const MAX_SELECTOR_NESTING: usize = 100;

fn parse_error(reason: &str) -> GraphsyncError {
    GraphsyncError::Decode(format!("selector spec parse rejected: {}", reason))
}

impl Selector {
    /// Parses a selector node. Fails with `GraphsyncError::Decode` on anything
    /// malformed, including recursive edges outside of a recursive selector.
    pub fn parse(node: &Node) -> Result<Selector> {
        parse_node(node, 0, 0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Selector> {
        Selector::parse(&Node::decode(bytes)?)
    }

    /// The children of `node` this selector may descend into. `None` means
    /// every child of the node is a candidate. Index and range selections
    /// are clamped to the children the node actually has.
    pub fn interests(&self, node: &Node) -> Option<Vec<PathSegment>> {
        match self {
            Selector::Matcher | Selector::ExploreRecursiveEdge => Some(vec![]),
            Selector::ExploreAll { .. } => None,
            Selector::ExploreFields { fields } => Some(
                fields
                    .keys()
                    .map(|name| PathSegment::Field(name.clone()))
                    .collect(),
            ),
            Selector::ExploreIndex { index, .. } => match node {
                Node::List(items) if *index < items.len() => Some(vec![PathSegment::Index(*index)]),
                _ => Some(vec![]),
            },
            Selector::ExploreRange { start, end, .. } => match node {
                Node::List(items) => {
                    let end = (*end).min(items.len());
                    Some((*start..end).map(PathSegment::Index).collect())
                }
                _ => Some(vec![]),
            },
            Selector::ExploreUnion(members) => {
                let mut interests = vec![];
                for member in members {
                    match member.interests(node) {
                        None => return None,
                        Some(segments) => {
                            for segment in segments {
                                if !interests.contains(&segment) {
                                    interests.push(segment);
                                }
                            }
                        }
                    }
                }
                Some(interests)
            }
            Selector::ExploreRecursive { current, .. } => current.interests(node),
        }
    }

    /// The selector to apply to the child of `node` reached through `segment`,
    /// or `None` if the child is not part of the selection.
    pub fn explore(&self, node: &Node, segment: &PathSegment) -> Option<Selector> {
        match self {
            Selector::Matcher | Selector::ExploreRecursiveEdge => None,
            Selector::ExploreAll { next } => Some(next.as_ref().clone()),
            Selector::ExploreFields { fields } => fields.get(&segment.as_field()).cloned(),
            Selector::ExploreIndex { index, next } => match (node, segment.as_index()) {
                (Node::List(_), Some(position)) if position == *index => {
                    Some(next.as_ref().clone())
                }
                _ => None,
            },
            Selector::ExploreRange { start, end, next } => match (node, segment.as_index()) {
                (Node::List(_), Some(position)) if position >= *start && position < *end => {
                    Some(next.as_ref().clone())
                }
                _ => None,
            },
            Selector::ExploreUnion(members) => {
                let mut explored: Vec<Selector> = members
                    .iter()
                    .filter_map(|member| member.explore(node, segment))
                    .collect();
                match explored.len() {
                    0 => None,
                    1 => explored.pop(),
                    _ => Some(Selector::ExploreUnion(explored)),
                }
            }
            Selector::ExploreRecursive {
                sequence,
                current,
                limit,
            } => {
                let next = current.explore(node, segment)?;
                if !has_recursive_edge(&next) {
                    return Some(Selector::ExploreRecursive {
                        sequence: sequence.clone(),
                        current: Box::new(next),
                        limit: *limit,
                    });
                }
                match limit {
                    RecursionLimit::Depth(depth) if *depth < 2 => replace_recursive_edge(next, None),
                    RecursionLimit::Depth(depth) => Some(Selector::ExploreRecursive {
                        sequence: sequence.clone(),
                        current: Box::new(replace_recursive_edge(next, Some(sequence))?),
                        limit: RecursionLimit::Depth(depth - 1),
                    }),
                    RecursionLimit::None => Some(Selector::ExploreRecursive {
                        sequence: sequence.clone(),
                        current: Box::new(replace_recursive_edge(next, Some(sequence))?),
                        limit: RecursionLimit::None,
                    }),
                }
            }
        }
    }

}

fn has_recursive_edge(selector: &Selector) -> bool {
    match selector {
        Selector::ExploreRecursiveEdge => true,
        Selector::ExploreUnion(members) => members
            .iter()
            .any(|member| matches!(member, Selector::ExploreRecursiveEdge)),
        _ => false,
    }
}

fn replace_recursive_edge(next: Selector, replacement: Option<&Selector>) -> Option<Selector> {
    match next {
        Selector::ExploreRecursiveEdge => replacement.cloned(),
        Selector::ExploreUnion(members) => {
            let mut replaced: Vec<Selector> = members
                .into_iter()
                .filter_map(|member| match member {
                    Selector::ExploreRecursiveEdge => replacement.cloned(),
                    other => Some(other),
                })
                .collect();
            match replaced.len() {
                0 => None,
                1 => replaced.pop(),
                _ => Some(Selector::ExploreUnion(replaced)),
            }
        }
        other => Some(other),
    }
}

fn contains_recursive_edge(selector: &Selector) -> bool {
    match selector {
        Selector::ExploreRecursiveEdge => true,
        Selector::Matcher => false,
        Selector::ExploreAll { next }
        | Selector::ExploreIndex { next, .. }
        | Selector::ExploreRange { next, .. } => contains_recursive_edge(next),
        Selector::ExploreFields { fields } => fields.values().any(contains_recursive_edge),
        Selector::ExploreUnion(members) => members.iter().any(contains_recursive_edge),
        // edges inside a nested recursive selector belong to it
        Selector::ExploreRecursive { .. } => false,
    }
}

fn single_entry(node: &Node) -> Result<(&str, &Node)> {
    let entries = node
        .as_map()
        .ok_or_else(|| parse_error("selector is a keyed union and thus must be a map"))?;
    if entries.len() != 1 {
        return Err(parse_error(
            "selector is a keyed union and thus must be a single-entry map",
        ));
    }
    entries
        .iter()
        .next()
        .map(|(key, value)| (key.as_str(), value))
        .ok_or_else(|| parse_error("selector is empty"))
}

fn field<'a>(body: &'a Node, name: &str, context: &str) -> Result<&'a Node> {
    body.as_map()
        .and_then(|entries| entries.get(name))
        .ok_or_else(|| parse_error(&format!("{} must have a '{}' field", context, name)))
}

fn usize_field(body: &Node, name: &str, context: &str) -> Result<usize> {
    let value = field(body, name, context)?
        .as_int()
        .ok_or_else(|| parse_error(&format!("{}: '{}' must be an integer", context, name)))?;
    if value < 0 {
        return Err(parse_error(&format!("{}: '{}' must be positive", context, name)));
    }
    Ok(value as usize)
}

fn parse_node(node: &Node, recursion_depth: usize, nesting: usize) -> Result<Selector> {
    if nesting > MAX_SELECTOR_NESTING {
        return Err(parse_error(&format!(
            "selector nesting exceeds {} levels",
            MAX_SELECTOR_NESTING
        )));
    }
    let (key, body) = single_entry(node)?;
    match key {
        "." => Ok(Selector::Matcher),
        "a" => Ok(Selector::ExploreAll {
            next: Box::new(parse_node(field(body, ">", "ExploreAll")?, recursion_depth, nesting + 1)?),
        }),
        "f" => {
            let selections = field(body, "f>", "ExploreFields")?.as_map().ok_or_else(|| {
                parse_error("ExploreFields: 'f>' must be a map")
            })?;
            let mut fields = BTreeMap::new();
            for (name, selection) in selections {
                fields.insert(name.clone(), parse_node(selection, recursion_depth, nesting + 1)?);
            }
            Ok(Selector::ExploreFields { fields })
        }
        "i" => Ok(Selector::ExploreIndex {
            index: usize_field(body, "i", "ExploreIndex")?,
            next: Box::new(parse_node(field(body, ">", "ExploreIndex")?, recursion_depth, nesting + 1)?),
        }),
        "r" => {
            let start = usize_field(body, "^", "ExploreRange")?;
            let end = usize_field(body, "$", "ExploreRange")?;
            if end <= start {
                return Err(parse_error(
                    "ExploreRange: end must be greater than start",
                ));
            }
            Ok(Selector::ExploreRange {
                start,
                end,
                next: Box::new(parse_node(field(body, ">", "ExploreRange")?, recursion_depth, nesting + 1)?),
            })
        }
        "|" => {
            let members = body
                .as_list()
                .ok_or_else(|| parse_error("ExploreUnion must be a list"))?;
            if members.is_empty() {
                return Err(parse_error("ExploreUnion must have at least one member"));
            }
            let members = members
                .iter()
                .map(|member| parse_node(member, recursion_depth, nesting + 1))
                .collect::<Result<Vec<Selector>>>()?;
            Ok(Selector::ExploreUnion(members))
        }
        "R" => {
            let limit = parse_limit(field(body, "l", "ExploreRecursive")?)?;
            let sequence = parse_node(field(body, ":>", "ExploreRecursive")?, recursion_depth + 1, nesting + 1)?;
            if !contains_recursive_edge(&sequence) {
                return Err(parse_error(
                    "ExploreRecursive must have at least one ExploreRecursiveEdge",
                ));
            }
            Ok(Selector::ExploreRecursive {
                current: Box::new(sequence.clone()),
                sequence: Box::new(sequence),
                limit,
            })
        }
        "@" => {
            if recursion_depth == 0 {
                return Err(parse_error(
                    "ExploreRecursiveEdge must be beneath ExploreRecursive",
                ));
            }
            Ok(Selector::ExploreRecursiveEdge)
        }
        other => Err(parse_error(&format!("unknown selector key '{}'", other))),
    }
}

fn parse_limit(node: &Node) -> Result<RecursionLimit> {
    let (key, body) = single_entry(node)
        .map_err(|_| parse_error("ExploreRecursive: limit must be a single-entry map"))?;
    match key {
        "none" => Ok(RecursionLimit::None),
        "depth" => {
            let depth = body
                .as_int()
                .ok_or_else(|| parse_error("ExploreRecursive: depth must be an integer"))?;
            if depth < 0 {
                return Err(parse_error("ExploreRecursive: depth must be positive"));
            }
            Ok(RecursionLimit::Depth(depth as u64))
        }
        other => Err(parse_error(&format!("unknown recursion limit '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parents_selector(limit: RecursionLimit) -> Selector {
        let builder = SelectorSpecBuilder::new();
        let spec = builder.explore_recursive(
            limit,
            builder.explore_fields(vec![(
                "Parents",
                builder.explore_all(builder.explore_recursive_edge()),
            )]),
        );
        Selector::parse(&spec).unwrap()
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        let builder = SelectorSpecBuilder::new();
        assert!(Selector::parse(&Node::Int(3)).is_err());
        assert!(Selector::parse(&builder.explore_recursive_edge()).is_err());
        assert!(Selector::parse(&builder.explore_recursive(
            RecursionLimit::None,
            builder.explore_all(builder.matcher())
        ))
        .is_err());
        assert!(Selector::parse(&builder.explore_range(4, 2, builder.matcher())).is_err());
        let unknown = Node::map(vec![("?", Node::map(Vec::<(String, Node)>::new()))]);
        assert!(matches!(
            Selector::parse(&unknown),
            Err(GraphsyncError::Decode(_))
        ));
    }

    #[test]
    fn interests_follow_selector_kind() {
        let builder = SelectorSpecBuilder::new();
        let fields = Selector::parse(&builder.explore_fields(vec![
            ("b", builder.matcher()),
            ("a", builder.matcher()),
        ]))
        .unwrap();
        let list = Node::list(vec![Node::Null, Node::Null, Node::Null]);
        assert_eq!(
            fields.interests(&list),
            Some(vec![PathSegment::from("a"), PathSegment::from("b")])
        );
        let all = Selector::parse(&builder.explore_all(builder.matcher())).unwrap();
        assert_eq!(all.interests(&list), None);
        let union = Selector::parse(&builder.explore_union(vec![
            builder.explore_index(1, builder.matcher()),
            builder.explore_range(0, 2, builder.matcher()),
        ]))
        .unwrap();
        assert_eq!(
            union.interests(&list),
            Some(vec![PathSegment::Index(1), PathSegment::Index(0)])
        );
        assert_eq!(Selector::Matcher.interests(&list), Some(vec![]));
    }

    #[test]
    fn depth_limited_recursion_runs_out() {
        let list = Node::list(vec![Node::Null]);
        let root = Node::map(vec![("Parents", list.clone())]);

        // depth 2: one full repetition of the sequence, then the edge is dropped
        let selector = parents_selector(RecursionLimit::Depth(2));
        let parents = selector.explore(&root, &PathSegment::from("Parents")).unwrap();
        let first = parents.explore(&list, &PathSegment::Index(0)).unwrap();
        assert!(matches!(first, Selector::ExploreRecursive { limit: RecursionLimit::Depth(1), .. }));
        let parents = first.explore(&root, &PathSegment::from("Parents")).unwrap();
        assert!(parents.explore(&list, &PathSegment::Index(0)).is_none());

        let unbounded = parents_selector(RecursionLimit::None);
        let mut current = unbounded;
        for _ in 0..50 {
            let parents = current.explore(&root, &PathSegment::from("Parents")).unwrap();
            current = parents.explore(&list, &PathSegment::Index(0)).unwrap();
        }
        assert!(current.explore(&root, &PathSegment::from("Messages")).is_none());
    }

    #[test]
    fn index_and_range_only_apply_to_lists() {
        let builder = SelectorSpecBuilder::new();
        let index = Selector::parse(&builder.explore_index(0, builder.matcher())).unwrap();
        let list = Node::list(vec![Node::Int(1)]);
        let map = Node::map(vec![("0", Node::Int(1))]);
        assert_eq!(index.explore(&list, &PathSegment::Index(0)), Some(Selector::Matcher));
        assert_eq!(index.explore(&map, &PathSegment::from("0")), None);
        assert_eq!(index.interests(&map), Some(vec![]));
    }

    #[test]
    fn huge_ranges_are_clamped_to_the_list() {
        let builder = SelectorSpecBuilder::new();
        let range = Selector::parse(&builder.explore_range(0, 1 << 40, builder.matcher())).unwrap();
        let list = Node::list(vec![Node::Int(1), Node::Int(2)]);
        assert_eq!(
            range.interests(&list),
            Some(vec![PathSegment::Index(0), PathSegment::Index(1)])
        );
        let past_the_end = Selector::parse(&builder.explore_range(5, 9, builder.matcher())).unwrap();
        assert_eq!(past_the_end.interests(&list), Some(vec![]));
        let index = Selector::parse(&builder.explore_index(1 << 40, builder.matcher())).unwrap();
        assert_eq!(index.interests(&list), Some(vec![]));
    }

    fn nested_explore_all(depth: usize) -> Node {
        let builder = SelectorSpecBuilder::new();
        let mut spec = builder.matcher();
        for _ in 0..depth {
            spec = builder.explore_all(spec);
        }
        spec
    }

    #[test]
    fn parse_bounds_nesting() {
        assert!(Selector::parse(&nested_explore_all(MAX_SELECTOR_NESTING)).is_ok());
        assert!(matches!(
            Selector::parse(&nested_explore_all(MAX_SELECTOR_NESTING + 1)),
            Err(GraphsyncError::Decode(_))
        ));

        // 200k nested single-element lists on the wire
        let mut bytes = Vec::with_capacity(400_001);
        for _ in 0..200_000 {
            bytes.extend_from_slice(&[6, 1]);
        }
        bytes.push(0);
        assert!(matches!(
            Selector::from_bytes(&bytes),
            Err(GraphsyncError::Decode(_))
        ));
    }
}
