//! Bounding volume hierarchy over a drawable's spans
//!
//! The tree is built top-down once per scene load by splitting the span set
//! at the median of the widest axis. Queries classify node bounds with a
//! caller-supplied test; a node classified fully visible contributes all of
//! its spans without testing them individually.

use super::cull_tree::Visibility;
use crate::scene::AABB;

/// Configuration for space tree construction
#[derive(Debug, Clone)]
pub struct SpaceTreeConfig {
    /// Maximum spans per leaf before splitting
    pub max_spans_per_leaf: usize,

    /// Maximum subdivision depth
    pub max_depth: u32,
}

impl Default for SpaceTreeConfig {
    fn default() -> Self {
        Self {
            max_spans_per_leaf: 4,
            max_depth: 16,
        }
    }
}

/// Single node in the hierarchy
#[derive(Debug, Clone)]
pub struct SpaceTreeNode {
    /// Bounds of every span below this node
    pub bounds: AABB,

    /// Spans stored in this node (if leaf)
    pub spans: Vec<(usize, AABB)>,

    /// Child nodes, None if this is a leaf
    pub children: Option<Box<[SpaceTreeNode; 2]>>,
}

impl SpaceTreeNode {
    fn build(mut entries: Vec<(usize, AABB)>, depth: u32, config: &SpaceTreeConfig) -> Option<Self> {
        let bounds = entries
            .iter()
            .map(|(_, bounds)| *bounds)
            .reduce(|a, b| a.union(&b))?;

        if entries.len() <= config.max_spans_per_leaf || depth >= config.max_depth {
            return Some(Self { bounds, spans: entries, children: None });
        }

        let size = bounds.max - bounds.min;
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };
        entries.sort_by(|(ia, a), (ib, b)| {
            a.center()[axis].total_cmp(&b.center()[axis]).then(ia.cmp(ib))
        });
        let upper = entries.split_off(entries.len() / 2);

        match (Self::build(entries, depth + 1, config), Self::build(upper, depth + 1, config)) {
            (Some(left), Some(right)) => Some(Self {
                bounds,
                spans: Vec::new(),
                children: Some(Box::new([left, right])),
            }),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        }
    }

    /// Check if this node is a leaf (has no children)
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    fn collect_all(&self, out: &mut Vec<usize>) {
        out.extend(self.spans.iter().map(|(index, _)| *index));
        if let Some(children) = &self.children {
            children.iter().for_each(|child| child.collect_all(out));
        }
    }

    fn harvest(&self, classify: &mut dyn FnMut(&AABB) -> Visibility, out: &mut Vec<usize>) {
        match classify(&self.bounds) {
            Visibility::Hidden => {}
            Visibility::Visible => self.collect_all(out),
            Visibility::Partial => {
                for (index, bounds) in &self.spans {
                    if classify(bounds) != Visibility::Hidden {
                        out.push(*index);
                    }
                }
                if let Some(children) = &self.children {
                    children.iter().for_each(|child| child.harvest(classify, out));
                }
            }
        }
    }

    fn count_nodes(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map_or(0, |children| children.iter().map(Self::count_nodes).sum())
    }
}

/// Bounding volume hierarchy over span bounds
#[derive(Debug, Clone, Default)]
pub struct SpaceTree {
    root: Option<SpaceTreeNode>,
    span_count: usize,
}

impl SpaceTree {
    /// Build a tree over `(span index, bounds)` pairs
    pub fn build(spans: impl IntoIterator<Item = (usize, AABB)>, config: &SpaceTreeConfig) -> Self {
        let entries: Vec<_> = spans.into_iter().collect();
        let span_count = entries.len();
        Self {
            root: SpaceTreeNode::build(entries, 0, config),
            span_count,
        }
    }

    /// Indices of spans not classified hidden, sorted ascending
    pub fn harvest(&self, mut classify: impl FnMut(&AABB) -> Visibility) -> Vec<usize> {
        let mut visible = Vec::new();
        if let Some(root) = &self.root {
            root.harvest(&mut classify, &mut visible);
        }
        visible.sort_unstable();
        visible
    }

    /// Indices of spans whose bounds intersect `bounds`, sorted ascending
    pub fn overlapping(&self, bounds: &AABB) -> Vec<usize> {
        self.harvest(|node| {
            if node.intersects(bounds) {
                Visibility::Partial
            } else {
                Visibility::Hidden
            }
        })
    }

    /// Bounds of everything in the tree
    pub fn bounds(&self) -> Option<AABB> {
        self.root.as_ref().map(|root| root.bounds)
    }

    /// Number of spans indexed
    pub fn span_count(&self) -> usize {
        self.span_count
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.root.as_ref().map_or(0, SpaceTreeNode::count_nodes)
    }

    /// Root node
    pub fn root(&self) -> Option<&SpaceTreeNode> {
        self.root.as_ref()
    }
}
