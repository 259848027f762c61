//! Evaluation results: image trees and content-identity trees.
//!
//! An evaluation produces a tree of drawable image nodes. The GPU backend
//! that consumes them is an external collaborator; here an image is its
//! geometry, its blend role and an optional sample payload. "No image" is a
//! sentinel node, not an error - an empty input list is intentional, a
//! broken input is `EvalError::EvaluationFailed`.

use std::sync::Arc;

use uuid::Uuid;

use crate::media::FramePayload;

/// How a composite node's children combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Replace,
    Over,
    Add,
    Difference,
}

impl BlendMode {
    pub fn from_str(s: &str) -> Self {
        match s {
            "add" => BlendMode::Add,
            "difference" => BlendMode::Difference,
            "replace" => BlendMode::Replace,
            _ => BlendMode::Over,
        }
    }
}

/// Render role of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// Children blended in order
    Blend,
    /// Leaf with a sample payload
    Leaf,
    /// Intentionally empty result
    NoImage,
}

/// One node of an evaluation result tree
#[derive(Debug, Clone)]
pub struct Image {
    /// Graph node that produced this image
    pub node: Uuid,
    pub kind: RenderKind,
    pub width: u32,
    pub height: u32,
    pub pixel_aspect: f32,
    pub blend: BlendMode,
    /// Sample payload for leaves. Shared with the frame cache.
    pub payload: Option<Arc<FramePayload>>,
    pub children: Vec<Image>,
}

impl Image {
    /// Blend parent with no payload of its own
    pub fn blend_root(node: Uuid, width: u32, height: u32) -> Self {
        Self {
            node,
            kind: RenderKind::Blend,
            width,
            height,
            pixel_aspect: 1.0,
            blend: BlendMode::Over,
            payload: None,
            children: Vec::new(),
        }
    }

    /// Leaf carrying decoded samples
    pub fn leaf(node: Uuid, payload: Arc<FramePayload>) -> Self {
        let (width, height) = (payload.width, payload.height);
        Self {
            node,
            kind: RenderKind::Leaf,
            width,
            height,
            pixel_aspect: 1.0,
            blend: BlendMode::Over,
            payload: Some(payload),
            children: Vec::new(),
        }
    }

    /// "No image" sentinel
    pub fn no_image(node: Uuid) -> Self {
        Self {
            node,
            kind: RenderKind::NoImage,
            width: 0,
            height: 0,
            pixel_aspect: 1.0,
            blend: BlendMode::Over,
            payload: None,
            children: Vec::new(),
        }
    }

    pub fn is_no_image(&self) -> bool {
        self.kind == RenderKind::NoImage
    }

    /// Total payload bytes in this tree. Shared payloads are counted once
    /// per reference; good enough for cache budgeting.
    pub fn mem(&self) -> usize {
        let own = self.payload.as_ref().map(|p| p.mem()).unwrap_or(0);
        own + self.children.iter().map(|c| c.mem()).sum::<usize>()
    }

    /// Number of leaves with payloads
    pub fn leaf_count(&self) -> usize {
        let own = usize::from(self.kind == RenderKind::Leaf);
        own + self.children.iter().map(|c| c.leaf_count()).sum::<usize>()
    }
}

/// Content-identity tree produced by `evaluate_identifier`.
///
/// Cheap to build (no samples are materialized) and stable: equal flattened
/// identities imply reusable cached pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdTree {
    pub id: String,
    pub children: Vec<IdTree>,
}

impl IdTree {
    pub fn leaf(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            children: Vec::new(),
        }
    }

    pub fn branch(id: impl Into<String>, children: Vec<IdTree>) -> Self {
        Self {
            id: id.into(),
            children,
        }
    }

    /// Deterministic single-string form, parent before children
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut String) {
        if !out.is_empty() {
            out.push('|');
        }
        out.push_str(&self.id);
        for c in &self.children {
            c.flatten_into(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FramePayload;

    #[test]
    fn test_tree_mem_and_leaves() {
        let node = Uuid::new_v4();
        let payload = Arc::new(FramePayload::solid(4, 2, 3, 0.5));
        let mut root = Image::blend_root(node, 4, 2);
        root.children.push(Image::leaf(node, Arc::clone(&payload)));
        root.children.push(Image::no_image(node));

        assert_eq!(root.leaf_count(), 1);
        assert_eq!(root.mem(), payload.mem());
    }

    #[test]
    fn test_id_tree_flatten_is_order_sensitive() {
        let a = IdTree::branch("stack", vec![IdTree::leaf("a/1"), IdTree::leaf("b/1")]);
        let b = IdTree::branch("stack", vec![IdTree::leaf("b/1"), IdTree::leaf("a/1")]);
        assert_eq!(a.flatten(), "stack|a/1|b/1");
        assert_ne!(a.flatten(), b.flatten());
    }
}
