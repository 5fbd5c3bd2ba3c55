//! Typed layer tree
//!
//! A model describes its structure as a tree of [`LayerNode`]s so that
//! callers can search it without knowing the concrete architecture.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dotted path of a layer inside the model, e.g. `features.3.conv`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerPath(String);

impl LayerPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Path of a direct child of this layer
    pub fn child(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}.{}", self.0, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for LayerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// What a layer does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// 2D convolution
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    },
    BatchNorm {
        features: usize,
    },
    Activation,
    Pool,
    Linear {
        in_features: usize,
        out_features: usize,
    },
    /// A grouping of other layers (a block, a stage, the whole model)
    Container,
}

impl LayerKind {
    pub fn is_convolutional(&self) -> bool {
        matches!(self, LayerKind::Conv2d { .. })
    }
}

/// One node of the layer tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerNode {
    pub path: LayerPath,
    pub kind: LayerKind,
    pub children: Vec<LayerNode>,
}

impl LayerNode {
    pub fn leaf(path: LayerPath, kind: LayerKind) -> Self {
        Self {
            path,
            kind,
            children: Vec::new(),
        }
    }

    pub fn container(path: LayerPath, children: Vec<LayerNode>) -> Self {
        Self {
            path,
            kind: LayerKind::Container,
            children,
        }
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    /// Find a direct child by its last path segment
    pub fn child(&self, name: &str) -> Option<&LayerNode> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Pre-order traversal: a node comes before its children, children in
    /// definition order.
    pub fn walk(&self) -> Vec<&LayerNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];

        while let Some(node) = stack.pop() {
            out.push(node);
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }

        out
    }

    /// Find a node anywhere below (or at) this one
    pub fn find(&self, path: &LayerPath) -> Option<&LayerNode> {
        self.walk().into_iter().find(|n| &n.path == path)
    }

    /// Indented tree rendering for the CLI
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let label = if self.path.as_str().is_empty() {
            "<root>"
        } else {
            self.path.as_str()
        };
        out.push_str(&format!("{}{} {:?}\n", "  ".repeat(depth), label, self.kind));
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(path: &str) -> LayerNode {
        LayerNode::leaf(
            LayerPath::new(path),
            LayerKind::Conv2d {
                in_channels: 1,
                out_channels: 1,
                kernel_size: 3,
            },
        )
    }

    #[test]
    fn test_layer_path_child_and_name() {
        let root = LayerPath::new("");
        let features = root.child("features");
        let conv = features.child("3").child("conv");

        assert_eq!(features.as_str(), "features");
        assert_eq!(conv.as_str(), "features.3.conv");
        assert_eq!(conv.name(), "conv");
    }

    #[test]
    fn test_walk_is_pre_order() {
        let tree = LayerNode::container(
            LayerPath::new(""),
            vec![
                LayerNode::container(LayerPath::new("a"), vec![conv("a.x"), conv("a.y")]),
                conv("b"),
            ],
        );

        let order: Vec<&str> = tree.walk().iter().map(|n| n.path.as_str()).collect();
        assert_eq!(order, vec!["", "a", "a.x", "a.y", "b"]);
    }

    #[test]
    fn test_find_and_child() {
        let tree = LayerNode::container(
            LayerPath::new(""),
            vec![LayerNode::container(LayerPath::new("a"), vec![conv("a.x")])],
        );

        assert!(tree.child("a").is_some());
        assert!(tree.child("x").is_none());
        assert!(tree.find(&LayerPath::new("a.x")).is_some());
    }
}
