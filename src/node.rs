use std::collections::BTreeMap;
use std::fmt;

use bincode::Options;
use serde::de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GraphsyncError, Result};
use crate::link::Link;
use crate::path::PathSegment;

/// The bincode configuration shared by every encoding in the crate. Nodes,
/// selectors and wire messages must agree on it for links to be stable.
pub(crate) fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .reject_trailing_bytes()
}

/// Deepest nesting of lists and maps a decoded node may have. Decoding
/// anything deeper fails instead of exhausting the stack.
pub const MAX_NODE_DEPTH: usize = 256;

/// An immutable DAG value. A block is the canonical encoding of one `Node`;
/// nodes refer to other blocks through `Node::Link`.
///
/// Maps are ordered by key so that equal maps always encode, and therefore
/// hash, identically.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
    Link(Link),
}

impl Node {
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Node {
        Node::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn list(items: impl IntoIterator<Item = Node>) -> Node {
        Node::List(items.into_iter().collect())
    }

    pub fn string(value: &str) -> Node {
        Node::String(value.to_string())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode_options().serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Node> {
        bincode_options()
            .deserialize(bytes)
            .map_err(|err| GraphsyncError::Decode(format!("malformed node: {}", err)))
    }

    /// The link of this node's canonical encoding.
    pub fn link(&self) -> Result<Link> {
        Ok(Link::for_bytes(&self.encode()?))
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self, Node::List(_) | Node::Map(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Node::List(items) => items.len(),
            Node::Map(entries) => entries.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a direct child. Lists accept index segments (or numeric
    /// field names); maps accept field segments.
    pub fn lookup(&self, segment: &PathSegment) -> Option<&Node> {
        match self {
            Node::List(items) => segment.as_index().and_then(|index| items.get(index)),
            Node::Map(entries) => entries.get(&segment.as_field()),
            _ => None,
        }
    }

    /// Every direct child with the segment that reaches it, in iteration order.
    pub fn entries(&self) -> Vec<(PathSegment, &Node)> {
        match self {
            Node::List(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| (PathSegment::Index(index), item))
                .collect(),
            Node::Map(entries) => entries
                .iter()
                .map(|(key, value)| (PathSegment::Field(key.clone()), value))
                .collect(),
            _ => vec![],
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Node>> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Node::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Node::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Link> {
        match self {
            Node::Link(link) => Some(link),
            _ => None,
        }
    }
}

const NODE_VARIANTS: &[&str] = &[
    "Null", "Bool", "Int", "Float", "String", "Bytes", "List", "Map", "Link",
];

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum NodeKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
    Link,
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Node, D::Error> {
        NodeSeed { depth: 0 }.deserialize(deserializer)
    }
}

// decodes one node at `depth` levels below the root
#[derive(Clone, Copy)]
struct NodeSeed {
    depth: usize,
}

impl NodeSeed {
    fn nested<E: de::Error>(self) -> std::result::Result<NodeSeed, E> {
        if self.depth >= MAX_NODE_DEPTH {
            return Err(E::custom(format!(
                "node nesting exceeds {} levels",
                MAX_NODE_DEPTH
            )));
        }
        Ok(NodeSeed {
            depth: self.depth + 1,
        })
    }
}

impl<'de> DeserializeSeed<'de> for NodeSeed {
    type Value = Node;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Node, D::Error> {
        deserializer.deserialize_enum("Node", NODE_VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for NodeSeed {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a node")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> std::result::Result<Node, A::Error> {
        let (kind, variant) = data.variant::<NodeKind>()?;
        match kind {
            NodeKind::Null => variant.unit_variant().map(|_| Node::Null),
            NodeKind::Bool => variant.newtype_variant().map(Node::Bool),
            NodeKind::Int => variant.newtype_variant().map(Node::Int),
            NodeKind::Float => variant.newtype_variant().map(Node::Float),
            NodeKind::String => variant.newtype_variant().map(Node::String),
            NodeKind::Bytes => variant
                .newtype_variant::<serde_bytes::ByteBuf>()
                .map(|bytes| Node::Bytes(bytes.into_vec())),
            NodeKind::List => variant
                .newtype_variant_seed(ListSeed(self.nested()?))
                .map(Node::List),
            NodeKind::Map => variant
                .newtype_variant_seed(MapSeed(self.nested()?))
                .map(Node::Map),
            NodeKind::Link => variant.newtype_variant().map(Node::Link),
        }
    }
}

struct ListSeed(NodeSeed);

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<Node>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Vec<Node>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ListSeed {
    type Value = Vec<Node>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of nodes")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<Node>, A::Error> {
        // the length prefix is untrusted
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

struct MapSeed(NodeSeed);

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, Node>;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<BTreeMap<String, Node>, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, Node>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of nodes")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<BTreeMap<String, Node>, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        Node::map(vec![
            ("Parents", Node::list(vec![Node::Link(Link::for_bytes(b"parent"))])),
            ("Messages", Node::list(vec![Node::Bytes(vec![1, 2, 3])])),
        ])
    }

    #[test]
    fn equal_maps_share_a_link() {
        let reordered = Node::map(vec![
            ("Messages", Node::list(vec![Node::Bytes(vec![1, 2, 3])])),
            ("Parents", Node::list(vec![Node::Link(Link::for_bytes(b"parent"))])),
        ]);
        assert_eq!(sample().link().unwrap(), reordered.link().unwrap());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Node::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, GraphsyncError::Decode(_)));
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(Node::decode(&bytes).is_err());
    }

    #[test]
    fn lookup_and_entries() {
        let node = sample();
        let parents = node.lookup(&PathSegment::from("Parents")).unwrap();
        assert!(parents.lookup(&PathSegment::Index(0)).unwrap().as_link().is_some());
        assert!(parents.lookup(&PathSegment::from("0")).is_some());
        assert!(parents.lookup(&PathSegment::Index(1)).is_none());
        let keys: Vec<String> = node
            .entries()
            .iter()
            .map(|(segment, _)| segment.to_string())
            .collect();
        assert_eq!(keys, vec!["Messages", "Parents"]);
        assert!(Node::Int(4).entries().is_empty());
    }

    // a list holding a list holding ... `depth` times, then a null
    fn nested_lists(depth: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(depth * 2 + 1);
        for _ in 0..depth {
            bytes.extend_from_slice(&[6, 1]);
        }
        bytes.push(0);
        bytes
    }

    #[test]
    fn decode_bounds_nesting() {
        let shallow = Node::decode(&nested_lists(MAX_NODE_DEPTH)).unwrap();
        assert_eq!(shallow.len(), 1);
        let err = Node::decode(&nested_lists(MAX_NODE_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, GraphsyncError::Decode(_)));
        let err = Node::decode(&nested_lists(200_000)).unwrap_err();
        assert!(matches!(err, GraphsyncError::Decode(_)));
    }

    #[test]
    fn decode_reads_every_kind() {
        let node = Node::map(vec![
            ("bool", Node::Bool(true)),
            ("bytes", Node::Bytes(vec![0, 1, 2])),
            ("float", Node::Float(1.5)),
            ("int", Node::Int(-7)),
            ("link", Node::Link(Link::for_bytes(b"child"))),
            ("list", Node::list(vec![Node::Null, Node::string("text")])),
        ]);
        assert_eq!(Node::decode(&node.encode().unwrap()).unwrap(), node);
    }
}
