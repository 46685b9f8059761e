//! Registration ordering.
//!
//! Slides are aligned pairwise, then chained to a reference through a
//! spanning tree. For unordered collections the tree maximizes total match
//! quality (Kruskal over all candidate pairs); for ordered series it is
//! the acquisition chain. Either way the result is a parent-pointer tree
//! plus a composition order in which every parent precedes its children,
//! so transforms can be composed in one forward pass.

/// A candidate alignment between two slides, by index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairEdge {
    pub a: usize,
    pub b: usize,

    /// Match quality, higher is better. Zero is allowed; a zero-quality
    /// edge can still be chosen when nothing better connects a slide.
    pub quality: f64,
}

impl PairEdge {
    pub fn new(a: usize, b: usize, quality: f64) -> Self {
        Self { a, b, quality }
    }

    /// Graph distance used for reference selection.
    fn distance(&self) -> f64 {
        1.0 / (1.0 + self.quality)
    }
}

/// Nodes that no chosen edge connects to the rest of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedComponents {
    pub unreachable: Vec<usize>,
}

// =============================================================================
// Union-Find
// =============================================================================

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        self.parent[rb] = ra;
        true
    }
}

// =============================================================================
// Registration Graph
// =============================================================================

/// Parent-pointer tree over slide indices with a fixed composition order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationGraph {
    parent: Vec<Option<usize>>,
    order: Vec<usize>,
    reference: usize,
}

impl RegistrationGraph {
    /// Build a maximum-quality spanning tree from candidate edges.
    ///
    /// With `reference: None`, the reference is the node with the smallest
    /// total edge distance `sum(1 / (1 + quality))`, ties to the lowest
    /// index. Fails with the unreachable node set when the edges do not
    /// span all nodes.
    pub fn spanning_tree(
        node_count: usize,
        edges: &[PairEdge],
        reference: Option<usize>,
    ) -> Result<Self, DisconnectedComponents> {
        debug_assert!(node_count > 0);

        // Kruskal: best quality first, scan order breaking ties.
        let mut ranked: Vec<&PairEdge> = edges
            .iter()
            .filter(|e| e.a != e.b && e.a < node_count && e.b < node_count)
            .collect();
        ranked.sort_by(|x, y| {
            y.quality
                .partial_cmp(&x.quality)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
        });

        let mut uf = UnionFind::new(node_count);
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        let mut taken = 0usize;
        for edge in ranked {
            if uf.union(edge.a, edge.b) {
                adjacency[edge.a].push(edge.b);
                adjacency[edge.b].push(edge.a);
                taken += 1;
                if taken == node_count - 1 {
                    break;
                }
            }
        }

        let reference = reference.unwrap_or_else(|| select_reference(node_count, edges));
        debug_assert!(reference < node_count);

        let tree = Self::from_adjacency(node_count, adjacency, reference);
        if tree.order.len() != node_count {
            let reached: std::collections::HashSet<usize> = tree.order.iter().copied().collect();
            return Err(DisconnectedComponents {
                unreachable: (0..node_count).filter(|i| !reached.contains(i)).collect(),
            });
        }
        Ok(tree)
    }

    /// Build the acquisition-order chain for an ordered series.
    ///
    /// With `reference: None`, the middle of the stack is used so chain
    /// depth (and accumulated error) is halved in both directions.
    pub fn chain(node_count: usize, reference: Option<usize>) -> Self {
        debug_assert!(node_count > 0);
        let reference = reference.unwrap_or(node_count / 2);
        debug_assert!(reference < node_count);

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        for i in 1..node_count {
            adjacency[i - 1].push(i);
            adjacency[i].push(i - 1);
        }
        Self::from_adjacency(node_count, adjacency, reference)
    }

    /// BFS from the reference; parents point toward the reference.
    fn from_adjacency(node_count: usize, mut adjacency: Vec<Vec<usize>>, reference: usize) -> Self {
        for neighbors in &mut adjacency {
            neighbors.sort_unstable();
        }

        let mut parent = vec![None; node_count];
        let mut visited = vec![false; node_count];
        let mut order = Vec::with_capacity(node_count);
        let mut queue = std::collections::VecDeque::new();

        visited[reference] = true;
        queue.push_back(reference);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &adjacency[node] {
                if !visited[next] {
                    visited[next] = true;
                    parent[next] = Some(node);
                    queue.push_back(next);
                }
            }
        }

        Self {
            parent,
            order,
            reference,
        }
    }

    pub fn node_count(&self) -> usize {
        self.parent.len()
    }

    /// The reference node all transforms compose toward.
    pub fn reference(&self) -> usize {
        self.reference
    }

    /// Parent of a node, `None` for the reference.
    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parent[node]
    }

    /// Composition order: the reference first, every parent before its
    /// children.
    pub fn compose_order(&self) -> &[usize] {
        &self.order
    }

    /// Number of hops from a node to the reference.
    pub fn depth(&self, node: usize) -> usize {
        let mut depth = 0;
        let mut current = node;
        while let Some(p) = self.parent[current] {
            current = p;
            depth += 1;
        }
        depth
    }

    /// Tree edges as `(child, parent)` pairs in composition order.
    pub fn tree_edges(&self) -> Vec<(usize, usize)> {
        self.order
            .iter()
            .filter_map(|&node| self.parent[node].map(|p| (node, p)))
            .collect()
    }
}

/// Node with minimum total distance over its incident edges.
fn select_reference(node_count: usize, edges: &[PairEdge]) -> usize {
    let mut totals = vec![0.0f64; node_count];
    for edge in edges {
        if edge.a == edge.b || edge.a >= node_count || edge.b >= node_count {
            continue;
        }
        let d = edge.distance();
        totals[edge.a] += d;
        totals[edge.b] += d;
    }
    let mut best = 0;
    for i in 1..node_count {
        if totals[i] < totals[best] {
            best = i;
        }
    }
    best
}

// =============================================================================
// Tests
// =============================================================================
