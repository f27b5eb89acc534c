//! Layer grouping for package closures.
//!
//! This module reads the runtime reference graph produced by the resolver
//! and partitions it into container image layers in a way that is likely
//! to match the partitioning of other images with overlapping
//! dependencies, maximising layer reuse across images.
//!
//! The algorithm works on a directed dependency graph with a synthetic
//! root node pointing at the requested top-level packages:
//!
//! ```text
//! img (root node)
//! │
//! ├───> A ─────┐
//! │            v
//! ├───> B ───> E
//! │            ^
//! ├───> C ─────┘
//! │     │
//! │     v
//! └───> D ───> F
//!       │
//!       └────> G
//! ```
//!
//! Nodes that are either very large or very popular across the package
//! set (think `glibc`, `openssl`) receive an additional edge directly
//! from the root, which promotes them into their own subtree of the
//! dominator tree computed next. Each immediate child of the root in the
//! dominator tree becomes one layer, together with every node it
//! dominates.
//!
//! If more layers result than the image is allowed to contain, layers are
//! merged in ascending order of their merge rating (the product of the
//! subtree root's popularity and the layer's total size) until the
//! budget is met.

use std::collections::HashMap;

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Closures larger than this are always considered for their own layer.
const SIZE_THRESHOLD: u64 = 100 * 1_000_000;

/// Reference count above which a package counts as popular. Roughly the
/// number of inbound references that only the top percentile of packages
/// reaches.
const POPULARITY_THRESHOLD: u64 = 1000;

/// Per-package popularity data, keyed by the package's short name and
/// calculated in advance from the upstream package set.
pub type Popularity = HashMap<String, u64>;

/// Structured information from the resolver about the runtime
/// dependencies of the requested packages.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeGraph {
    #[serde(rename = "exportReferencesGraph")]
    pub references: ExportedReferences,

    pub graph: Vec<GraphNode>,
}

/// The top-level store paths requested for the image.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportedReferences {
    pub graph: Vec<String>,
}

/// One node of the runtime reference graph.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphNode {
    pub path: String,

    #[serde(rename = "closureSize", default)]
    pub size: u64,

    #[serde(rename = "references", default)]
    pub refs: Vec<String>,
}

/// A single layer of the assembled image: the store paths it contains
/// and the rating used for merge and ordering decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub contents: Vec<String>,
    pub merge_rating: u64,
}

impl Layer {
    /// Deterministic identity of this layer, used as a cache key. Not
    /// used as an on-wire digest.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.contents.join(":").as_bytes());
        hex::encode(hasher.finalize())
    }

    fn merge(mut self, other: Layer) -> Layer {
        self.contents.extend(other.contents);
        self.contents.sort();
        self.merge_rating += other.merge_rating;
        self
    }
}

/// Strip the store prefix from a path, leaving the package's short name
/// as used in the popularity table.
pub fn package_from_path(path: &str) -> &str {
    fn store_prefix() -> &'static Regex {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| Regex::new("^/nix/store/[a-z0-9]+-").unwrap())
    }

    match store_prefix().find(path) {
        Some(m) => &path[m.end()..],
        None => path,
    }
}

/// A node of the internal dependency graph. The graph itself only holds
/// these records; all relationships live in the edge set.
#[derive(Debug)]
struct Closure {
    path: String,
    size: u64,
    popularity: u64,
}

impl Closure {
    /// Whether this closure should be considered for separation into its
    /// own layer even when it would otherwise sit inside a subtree.
    fn big_or_popular(&self) -> bool {
        self.size > SIZE_THRESHOLD || self.popularity >= POPULARITY_THRESHOLD
    }
}

fn build_graph(refs: &RuntimeGraph, pop: &Popularity) -> (DiGraph<Closure, ()>, NodeIndex) {
    let mut graph: DiGraph<Closure, ()> = DiGraph::new();

    // Synthetic root representing the image itself; every top-level
    // package is a child of it.
    let root = graph.add_node(Closure {
        path: "image_root".to_string(),
        size: 0,
        popularity: 0,
    });

    let mut by_path: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &refs.graph {
        let popularity = pop
            .get(package_from_path(&node.path))
            .copied()
            .unwrap_or(1);

        let idx = graph.add_node(Closure {
            path: node.path.clone(),
            size: node.size,
            popularity,
        });
        by_path.insert(node.path.as_str(), idx);
    }

    for top in &refs.references.graph {
        if let Some(&idx) = by_path.get(top.as_str()) {
            graph.update_edge(root, idx, ());
        }
    }

    for node in &refs.graph {
        let from = by_path[node.path.as_str()];

        // Big or popular nodes get a separate edge from the root to
        // flag them for their own layer.
        if graph[from].big_or_popular() {
            graph.update_edge(root, from, ());
        }

        for r in &node.refs {
            // The resolver adds a self reference to each node, which
            // must not become an edge.
            if r != &node.path {
                if let Some(&to) = by_path.get(r.as_str()) {
                    graph.update_edge(from, to, ());
                }
            }
        }
    }

    (graph, root)
}

/// Convert the dominator-tree subtree rooted at `top` into a flat layer.
fn subtree_layer(
    graph: &DiGraph<Closure, ()>,
    children: &HashMap<NodeIndex, Vec<NodeIndex>>,
    top: NodeIndex,
) -> Layer {
    let mut contents = Vec::new();
    let mut size = 0u64;

    let mut stack = vec![top];
    while let Some(idx) = stack.pop() {
        let closure = &graph[idx];
        contents.push(closure.path.clone());
        size += closure.size;

        if let Some(kids) = children.get(&idx) {
            stack.extend(kids.iter().copied());
        }
    }

    // Contents are sorted to keep layer hashing consistent
    contents.sort();

    Layer {
        contents,
        merge_rating: graph[top].popularity * size,
    }
}

fn rating_order(a: &Layer, b: &Layer) -> std::cmp::Ordering {
    a.merge_rating
        .cmp(&b.merge_rating)
        .then_with(|| a.contents.cmp(&b.contents))
}

/// Compute the dominator tree of the whole package graph and derive one
/// layer per top-level subtree, merging the lowest-rated layers until
/// the budget is met.
fn dominate(budget: usize, graph: &DiGraph<Closure, ()>, root: NodeIndex) -> Vec<Layer> {
    let dom = dominators::simple_fast(graph, root);

    let mut children: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for idx in graph.node_indices() {
        if idx == root {
            continue;
        }
        match dom.immediate_dominator(idx) {
            Some(idom) => children.entry(idom).or_default().push(idx),
            // Nodes outside the closure of the requested roots cannot
            // appear in any layer.
            None => tracing::warn!(path = %graph[idx].path, "graph node unreachable from image root"),
        }
    }

    let mut layers: Vec<Layer> = children
        .get(&root)
        .map(|tops| {
            tops.iter()
                .map(|&top| subtree_layer(graph, &children, top))
                .collect()
        })
        .unwrap_or_default();

    layers.sort_by(rating_order);

    if layers.len() > budget {
        tracing::debug!(
            ideal = layers.len(),
            budget,
            "ideal layer count exceeds budget, merging"
        );
    }

    while layers.len() > budget {
        let a = layers.remove(0);
        let b = layers.remove(0);
        layers.push(a.merge(b));
        layers.sort_by(rating_order);
    }

    layers
}

/// Group the runtime reference graph into at most `budget` layers.
///
/// The returned layers are ordered by ascending merge rating; manifest
/// assembly re-sorts them for emission.
pub fn group(refs: &RuntimeGraph, pop: &Popularity, budget: usize) -> Vec<Layer> {
    let (graph, root) = build_graph(refs, pop);
    dominate(budget, &graph, root)
}
