//! Side table from tree node values to store ids.

use crate::doc::NodeKey;
use crate::store::ExternalId;
use std::collections::{HashMap, HashSet};

/// Non-owning map between node keys and external ids. Each node holds at
/// most one id and each id is bound to at most one node.
#[derive(Debug, Default, Clone)]
pub struct IdentityRegistry {
    by_node: HashMap<NodeKey, ExternalId>,
    by_id: HashMap<ExternalId, NodeKey>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, node: NodeKey) -> Option<&ExternalId> {
        self.by_node.get(&node)
    }

    pub fn node_of(&self, id: &ExternalId) -> Option<NodeKey> {
        self.by_id.get(id).copied()
    }

    /// Binds `id` to `node`, moving it off whichever node held it before.
    pub fn bind(&mut self, node: NodeKey, id: ExternalId) {
        if let Some(previous) = self.by_id.insert(id.clone(), node)
            && previous != node
        {
            self.by_node.remove(&previous);
        }
        if let Some(stale) = self.by_node.insert(node, id.clone())
            && stale != id
        {
            self.by_id.remove(&stale);
        }
    }

    pub fn release(&mut self, node: NodeKey) -> Option<ExternalId> {
        let id = self.by_node.remove(&node)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn release_id(&mut self, id: &ExternalId) -> Option<NodeKey> {
        let node = self.by_id.remove(id)?;
        self.by_node.remove(&node);
        Some(node)
    }

    /// Drops entries whose node is not in `live`. Returns how many were dropped.
    pub fn retain_live(&mut self, live: &HashSet<NodeKey>) -> usize {
        let before = self.by_node.len();
        let by_id = &mut self.by_id;
        self.by_node.retain(|node, id| {
            let keep = live.contains(node);
            if !keep {
                by_id.remove(id);
            }
            keep
        });
        before - self.by_node.len()
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ExternalId> {
        self.by_id.keys()
    }
}
