//! Wildcard matching of dot separated topics against binding patterns.
//!
//! Patterns are stored in a trie keyed by segment. `*` matches exactly one
//! segment and `#` matches zero or more segments.

use std::collections::{HashMap, HashSet};

const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = "#";

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Set when a pattern ends at this node
    pattern: Option<String>,
}

/// Position of the forward walk: `node` has consumed `segments[..index]`
struct State<'a> {
    node: &'a Node,
    index: usize,
    absorbing: bool,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.children.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TopicMatcher {
    root: Node,
    count: usize,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern. Returns false if it was already present.
    pub fn add(&mut self, pattern: &str) -> bool {
        let mut node = &mut self.root;
        for segment in pattern.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        if node.pattern.is_some() {
            return false;
        }
        node.pattern = Some(pattern.to_string());
        self.count += 1;
        true
    }

    /// Unregister a pattern, pruning trie branches left empty.
    pub fn remove(&mut self, pattern: &str) -> bool {
        let segments: Vec<&str> = pattern.split('.').collect();
        let removed = Self::remove_from(&mut self.root, &segments);
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn remove_from(node: &mut Node, segments: &[&str]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return node.pattern.take().is_some();
        };
        let Some(child) = node.children.get_mut(*first) else {
            return false;
        };
        let removed = Self::remove_from(child, rest);
        if removed && child.is_empty() {
            node.children.remove(*first);
        }
        removed
    }

    /// Invoke `consumer` once for every stored pattern matching `topic`.
    pub fn matching_bindings<F: FnMut(&str)>(&self, topic: &str, mut consumer: F) {
        let segments: Vec<&str> = topic.split('.').collect();
        for pattern in self.collect(&segments) {
            consumer(pattern);
        }
    }

    /// Convenience wrapper returning the matches as owned strings
    pub fn matches(&self, topic: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.matching_bindings(topic, |pattern| out.push(pattern.to_string()));
        out
    }

    /// Walk the topic front to back over the set of trie positions reached so
    /// far. Each state is expanded at most once, so the work is
    /// bounded by trie size times topic depth whatever the `#` layout.
    fn collect<'a>(&'a self, segments: &[&str]) -> HashSet<&'a str> {
        let mut matched = HashSet::new();
        let mut visited: HashSet<(*const Node, usize, bool)> = HashSet::new();
        let mut pending: Vec<State<'a>> = vec![State {
            node: &self.root,
            index: 0,
            absorbing: false,
        }];

        while let Some(state) = pending.pop() {
            if !visited.insert((state.node as *const Node, state.index, state.absorbing)) {
                continue;
            }
            let State { node, index, absorbing } = state;

            // `#` matches zero segments
            if let Some(hash) = node.children.get(MULTI_WILDCARD) {
                pending.push(State { node: hash, index, absorbing: true });
            }

            let Some(segment) = segments.get(index) else {
                if let Some(pattern) = &node.pattern {
                    matched.insert(pattern.as_str());
                }
                continue;
            };

            // a `#` node swallows one more segment and stays put
            if absorbing {
                pending.push(State { node, index: index + 1, absorbing: true });
            }
            if let Some(child) = node.children.get(*segment) {
                pending.push(State { node: child, index: index + 1, absorbing: false });
            }
            if let Some(child) = node.children.get(SINGLE_WILDCARD) {
                pending.push(State { node: child, index: index + 1, absorbing: false });
            }
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
