use std::fmt;

use serde::{Deserialize, Serialize};

/// A single step from a node to one of its children
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum PathSegment {
    /// A map key
    Field(String),
    /// A list position
    Index(usize),
}

impl PathSegment {
    /// Interprets the segment as a list index. Field names that parse as
    /// integers are accepted, so `"0"` and `Index(0)` address the same element.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Field(name) => name.parse().ok(),
        }
    }

    pub fn as_field(&self) -> String {
        match self {
            PathSegment::Field(name) => name.clone(),
            PathSegment::Index(index) => index.to_string(),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        PathSegment::Field(name.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, "{}", name),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

/// The route from a traversal root to a node, rendered as `"Parents/0/Parents"`.
/// The root itself has the empty path.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Default)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn new() -> Path {
        Path { segments: vec![] }
    }

    /// Returns a new path with `segment` appended.
    pub fn append(&self, segment: PathSegment) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Path { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .segments
            .iter()
            .map(|segment| segment.to_string())
            .collect::<Vec<String>>()
            .join("/");
        write!(f, "{}", rendered)
    }
}
