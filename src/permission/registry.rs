//! Arena-backed permission scheme tree.
//!
//! Nodes live in a `Vec` and refer to their parent by index, so ancestor
//! checks walk integer links and the whole registry is a plain `Clone`.

use std::collections::HashMap;

use tsuru_types::{ContextType, PermissionContext};

use super::scheme::{validate_segment, PermissionScheme, SchemeId, SchemeNode, ROOT};
use super::token::Token;
use crate::error::{Result, TsuruError};

#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    nodes: Vec<SchemeNode>,
    by_name: HashMap<String, SchemeId>,
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionRegistry {
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        by_name.insert(String::new(), ROOT);
        Self {
            nodes: vec![SchemeNode::root()],
            by_name,
        }
    }

    // ── Building ──

    /// Registers `name` without its own context list.
    pub fn add(&mut self, name: &str) -> Result<SchemeId> {
        self.register(name, None)
    }

    /// Registers `name` allowing `contexts` (plus `global`).
    pub fn add_with_contexts(&mut self, name: &str, contexts: &[ContextType]) -> Result<SchemeId> {
        self.register(name, Some(contexts.to_vec()))
    }

    /// Chaining form of [`add`](Self::add).
    pub fn with(mut self, name: &str) -> Result<Self> {
        self.register(name, None)?;
        Ok(self)
    }

    /// Chaining form of [`add_with_contexts`](Self::add_with_contexts).
    pub fn with_contexts(mut self, name: &str, contexts: &[ContextType]) -> Result<Self> {
        self.register(name, Some(contexts.to_vec()))?;
        Ok(self)
    }

    /// Missing intermediate segments are created without a context list.
    /// Registering an existing name returns the existing node; a context list
    /// is only applied if the node did not declare one yet.
    pub fn register(&mut self, name: &str, contexts: Option<Vec<ContextType>>) -> Result<SchemeId> {
        if name.is_empty() {
            if let Some(contexts) = contexts {
                self.nodes[ROOT].contexts.get_or_insert(contexts);
            }
            return Ok(ROOT);
        }
        let mut parent = ROOT;
        let mut path = String::new();
        for segment in name.split('.') {
            validate_segment(segment, name)?;
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(segment);
            parent = match self.by_name.get(&path) {
                Some(&id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(SchemeNode {
                        segment: segment.to_string(),
                        parent: Some(parent),
                        contexts: None,
                        children: Vec::new(),
                    });
                    self.nodes[parent].children.push(id);
                    self.by_name.insert(path.clone(), id);
                    id
                }
            };
        }
        if let Some(contexts) = contexts {
            self.nodes[parent].contexts.get_or_insert(contexts);
        }
        Ok(parent)
    }

    // ── Lookup ──

    pub(crate) fn node(&self, id: SchemeId) -> &SchemeNode {
        &self.nodes[id]
    }

    pub fn scheme(&self, id: SchemeId) -> Option<PermissionScheme<'_>> {
        (id < self.nodes.len()).then(|| self.view(id))
    }

    /// Ids handed out by this registry are always in range.
    pub(crate) fn view(&self, id: SchemeId) -> PermissionScheme<'_> {
        PermissionScheme { registry: self, id }
    }

    pub fn root(&self) -> PermissionScheme<'_> {
        self.view(ROOT)
    }

    /// Resolves a dotted name. `""` is the root.
    pub fn get(&self, name: &str) -> Result<PermissionScheme<'_>> {
        self.by_name
            .get(name)
            .map(|&id| self.view(id))
            .ok_or_else(|| TsuruError::UnregisteredPermission(name.to_string()))
    }

    /// Like [`get`](Self::get) but maps `*` to the root.
    pub fn get_or_root(&self, name: &str) -> Result<PermissionScheme<'_>> {
        if name == "*" {
            return Ok(self.root());
        }
        self.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Every non-root node, depth-first, children in declaration order.
    pub fn permissions(&self) -> Vec<PermissionScheme<'_>> {
        let mut out = Vec::with_capacity(self.nodes.len().saturating_sub(1));
        let mut stack: Vec<SchemeId> = self.nodes[ROOT].children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(self.view(id));
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        out
    }

    pub fn permissions_with_context_type(&self, ctx: ContextType) -> Vec<PermissionScheme<'_>> {
        self.permissions()
            .into_iter()
            .filter(|s| s.allows(ctx))
            .collect()
    }

    pub fn is_ancestor_or_self(&self, ancestor: SchemeId, node: SchemeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.parent);
        }
        false
    }

    // ── Evaluation ──

    /// True if the token holds `required` or an ancestor of it, in a global
    /// context or in one matching any of `contexts` by type and value.
    pub fn check(
        &self,
        token: &dyn Token,
        required: SchemeId,
        contexts: &[PermissionContext],
    ) -> bool {
        token.permissions().iter().any(|held| {
            self.is_ancestor_or_self(held.scheme, required)
                && (held.context.ctx_type == ContextType::Global
                    || contexts.iter().any(|ctx| {
                        ctx.ctx_type == held.context.ctx_type && ctx.value == held.context.value
                    }))
        })
    }

    /// Contexts in which the token holds `scheme` (directly or through an
    /// ancestor), optionally restricted to `ctx_types`.
    pub fn contexts_for_permission(
        &self,
        token: &dyn Token,
        scheme: SchemeId,
        ctx_types: &[ContextType],
    ) -> Vec<PermissionContext> {
        token
            .permissions()
            .into_iter()
            .filter(|held| self.is_ancestor_or_self(held.scheme, scheme))
            .filter(|held| ctx_types.is_empty() || ctx_types.contains(&held.context.ctx_type))
            .map(|held| held.context)
            .collect()
    }
}
