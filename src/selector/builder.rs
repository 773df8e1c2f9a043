use crate::node::Node;
use crate::selector::RecursionLimit;

fn empty() -> Node {
    Node::map(Vec::<(String, Node)>::new())
}

fn keyed(key: &str, body: Node) -> Node {
    Node::map(vec![(key, body)])
}

/// Builds selector specification nodes, the form selectors take on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectorSpecBuilder {}

impl SelectorSpecBuilder {
    pub fn new() -> Self {
        SelectorSpecBuilder {}
    }

    pub fn matcher(&self) -> Node {
        keyed(".", empty())
    }

    pub fn explore_all(&self, next: Node) -> Node {
        keyed("a", Node::map(vec![(">", next)]))
    }

    pub fn explore_fields<K: Into<String>>(&self, fields: Vec<(K, Node)>) -> Node {
        keyed("f", Node::map(vec![("f>", Node::map(fields))]))
    }

    pub fn explore_index(&self, index: usize, next: Node) -> Node {
        keyed(
            "i",
            Node::map(vec![("i", Node::Int(index as i64)), (">", next)]),
        )
    }

    pub fn explore_range(&self, start: usize, end: usize, next: Node) -> Node {
        keyed(
            "r",
            Node::map(vec![
                ("^", Node::Int(start as i64)),
                ("$", Node::Int(end as i64)),
                (">", next),
            ]),
        )
    }

    pub fn explore_union(&self, members: Vec<Node>) -> Node {
        keyed("|", Node::List(members))
    }

    pub fn explore_recursive(&self, limit: RecursionLimit, sequence: Node) -> Node {
        let limit = match limit {
            RecursionLimit::None => keyed("none", empty()),
            RecursionLimit::Depth(depth) => keyed("depth", Node::Int(depth as i64)),
        };
        keyed("R", Node::map(vec![("l", limit), (":>", sequence)]))
    }

    pub fn explore_recursive_edge(&self) -> Node {
        keyed("@", empty())
    }
}
