//! Permission scheme nodes and naming.

use tsuru_types::ContextType;

use super::registry::PermissionRegistry;
use crate::error::{Result, TsuruError};

/// Index of a scheme node inside its registry.
pub type SchemeId = usize;

/// The root node (`""`, identifier `All`).
pub const ROOT: SchemeId = 0;

#[derive(Debug, Clone)]
pub(crate) struct SchemeNode {
    pub(crate) segment: String,
    pub(crate) parent: Option<SchemeId>,
    /// `None` inherits from the nearest ancestor that declares a list.
    pub(crate) contexts: Option<Vec<ContextType>>,
    pub(crate) children: Vec<SchemeId>,
}

impl SchemeNode {
    pub(crate) fn root() -> Self {
        Self {
            segment: String::new(),
            parent: None,
            contexts: None,
            children: Vec::new(),
        }
    }
}

/// Borrowed view of one node.
#[derive(Clone, Copy)]
pub struct PermissionScheme<'a> {
    pub(crate) registry: &'a PermissionRegistry,
    pub(crate) id: SchemeId,
}

impl<'a> PermissionScheme<'a> {
    pub fn id(&self) -> SchemeId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT
    }

    /// Last segment of the dotted name.
    pub fn segment(&self) -> &'a str {
        &self.registry.node(self.id).segment
    }

    pub fn parent(&self) -> Option<PermissionScheme<'a>> {
        self.registry
            .node(self.id)
            .parent
            .map(|id| self.registry.view(id))
    }

    /// Segments from the root (excluded) down to this node.
    pub fn segments(&self) -> Vec<&'a str> {
        let mut segments = Vec::new();
        let mut current = Some(*self);
        while let Some(scheme) = current {
            if !scheme.is_root() {
                segments.push(scheme.segment());
            }
            current = scheme.parent();
        }
        segments.reverse();
        segments
    }

    pub fn full_name(&self) -> String {
        self.segments().join(".")
    }

    pub fn identifier(&self) -> String {
        identifier_for(&self.segments())
    }

    /// `global` plus the nearest declared list on the path to the root.
    pub fn allowed_contexts(&self) -> Vec<ContextType> {
        let mut allowed = vec![ContextType::Global];
        let mut current = Some(self.id);
        while let Some(id) = current {
            let node = self.registry.node(id);
            if let Some(contexts) = &node.contexts {
                for ctx in contexts {
                    if !allowed.contains(ctx) {
                        allowed.push(*ctx);
                    }
                }
                break;
            }
            current = node.parent;
        }
        allowed
    }

    pub fn allows(&self, ctx: ContextType) -> bool {
        self.allowed_contexts().contains(&ctx)
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn is_parent_of(&self, other: &PermissionScheme<'_>) -> bool {
        self.registry.is_ancestor_or_self(self.id, other.id)
    }
}

impl std::fmt::Debug for PermissionScheme<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionScheme")
            .field("id", &self.id)
            .field("full_name", &self.full_name())
            .finish()
    }
}

impl PartialEq for PermissionScheme<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.registry, other.registry) && self.id == other.id
    }
}

/// Title-cases every `-` separated word of every segment and joins the result.
pub fn identifier_for(segments: &[&str]) -> String {
    if segments.is_empty() {
        return "All".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        for word in segment.split('-') {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

pub(crate) fn validate_segment(segment: &str, full: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TsuruError::InvalidInput(format!(
            "invalid permission name {full:?}: segment {segment:?} must match [a-z0-9-]+"
        )))
    }
}
