//! The hierarchy index: owner of every inserted [`NodeRecord`] and the only
//! place where cross-node relationships are mutated.
//!
//! Relationships are plain id lookups into the index, so there are no
//! back-pointers between records. Iteration follows insertion order, which
//! keeps batch operations and ordering reproducible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::node::{NodeRecord, Policy};
use crate::types::{NodeKind, Status};

const SNAPSHOT_VERSION: u32 = 1;

/// First serial handed out by a fresh index.
pub const FIRST_SERIAL: u64 = 1;

#[derive(Debug)]
pub struct HierarchyIndex {
    pub(crate) id: String,
    pub(crate) nodes: HashMap<String, NodeRecord>,
    pub(crate) insertion_order: Vec<String>,
    serial: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    id: String,
    serial: u64,
    saved_at: DateTime<Utc>,
    nodes: Vec<NodeRecord>,
}

impl HierarchyIndex {
    /// An empty hierarchy with a random UUID identifier.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: HashMap::new(),
            insertion_order: Vec::new(),
            serial: AtomicU64::new(FIRST_SERIAL),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Links a detached record into the tree.
    ///
    /// A self-issued authority declared with a zero path limit becomes a
    /// self-signed end-entity. Any other record must name an issuer that is
    /// already present and still allowed to sign. On failure the index is
    /// left untouched.
    pub fn insert(&mut self, mut node: NodeRecord) -> Result<()> {
        if let Some(owner) = node.hierarchy_id() {
            return Err(Error::InvalidInput(format!(
                "{} is already attached to hierarchy {}",
                node.id, owner
            )));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(Error::DuplicateId(node.id));
        }
        // Child links and progress are rebuilt by this index.
        node.signed_ids.clear();
        node.reset(Status::AwaitingKey);

        if node.is_root() && node.kind == NodeKind::Authority && node.path_limit < 1 {
            debug!(node = %node.id, "Self-signed authority without path length becomes an end-entity");
            node.kind = NodeKind::EndEntity;
            node.signed_ids = vec![node.id.clone()];
        }

        if !node.is_root() {
            let issuer = self
                .nodes
                .get(&node.issuer_id)
                .ok_or_else(|| Error::UnresolvedIssuer(node.issuer_id.clone()))?;
            if !issuer.can_issue() {
                return Err(Error::IneligibleIssuer {
                    issuer: issuer.id.clone(),
                    kind: issuer.kind,
                    path_limit: issuer.path_limit,
                });
            }
            node.path_limit = match node.kind {
                NodeKind::EndEntity => 0,
                NodeKind::Authority => issuer.path_limit - 1,
            };
        } else if node.kind == NodeKind::EndEntity {
            node.path_limit = 0;
        }

        if node.is_root() && !node.signed_ids.contains(&node.id) {
            node.signed_ids.push(node.id.clone());
        }
        node.hierarchy = Some(self.id.clone());

        let id = node.id.clone();
        let issuer_id = node.issuer_id.clone();
        info!(
            node = %id,
            issuer = %issuer_id,
            kind = ?node.kind,
            path_limit = node.path_limit,
            "Node inserted"
        );
        self.nodes.insert(id.clone(), node);
        self.insertion_order.push(id.clone());

        if let Some(issuer) = self.nodes.get_mut(&issuer_id) {
            if !issuer.signed_ids.contains(&id) {
                issuer.signed_ids.push(id);
            }
        }

        Ok(())
    }

    /// Returns the next certificate serial and advances the counter.
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    /// The serial the next issuance will receive.
    pub fn current_serial(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn list_ids(&self) -> Vec<String> {
        self.insertion_order.clone()
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Records in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.insertion_order
            .iter()
            .filter_map(move |id| self.nodes.get(id))
    }

    /// Policy of an inserted node. Changing it does not touch relationships
    /// that were already established.
    pub fn policy_mut(&mut self, id: &str) -> Option<&mut Policy> {
        self.nodes.get_mut(id).map(|n| &mut n.policy)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id)
    }

    /// JSON snapshot of every record plus the serial counter.
    pub fn serialize(&self) -> Result<String> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            id: self.id.clone(),
            serial: self.current_serial(),
            saved_at: Utc::now(),
            nodes: self.nodes().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Rebuilds an index from [`serialize`](Self::serialize) output, checking
    /// every structural invariant on the way.
    pub fn restore(blob: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(blob)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }

        let mut index = HierarchyIndex::with_id(snapshot.id);
        index.serial = AtomicU64::new(snapshot.serial);

        for node in snapshot.nodes {
            index.check_restored(&node)?;
            index.insertion_order.push(node.id.clone());
            index.nodes.insert(node.id.clone(), node);
        }

        for node in index.nodes.values() {
            let mut seen = HashSet::new();
            for child in &node.signed_ids {
                if !seen.insert(child) {
                    return Err(Error::Snapshot(format!(
                        "{} lists {} twice",
                        node.id, child
                    )));
                }
                let linked = index
                    .nodes
                    .get(child)
                    .is_some_and(|c| c.issuer_id == node.id);
                if !linked {
                    return Err(Error::Snapshot(format!(
                        "{} lists {} which it did not issue",
                        node.id, child
                    )));
                }
            }
            let listed = index
                .nodes
                .get(&node.issuer_id)
                .is_some_and(|issuer| issuer.signed_ids.contains(&node.id));
            if !node.is_root() && !listed {
                return Err(Error::Snapshot(format!(
                    "{} is missing from the signed list of {}",
                    node.id, node.issuer_id
                )));
            }
        }

        info!(hierarchy = %index.id, nodes = index.len(), "Hierarchy restored");
        Ok(index)
    }

    // Records are stored in insertion order, so every issuer precedes its
    // children and acyclicity follows from the issuer check.
    fn check_restored(&self, node: &NodeRecord) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::Snapshot(format!("duplicate node {}", node.id)));
        }
        if node.hierarchy.as_deref() != Some(self.id.as_str()) {
            return Err(Error::Snapshot(format!(
                "{} belongs to another hierarchy",
                node.id
            )));
        }
        if node.kind == NodeKind::EndEntity && node.path_limit != 0 {
            return Err(Error::Snapshot(format!(
                "end-entity {} has a path limit",
                node.id
            )));
        }
        if node.is_root() {
            return Ok(());
        }

        let issuer = self.nodes.get(&node.issuer_id).ok_or_else(|| {
            Error::Snapshot(format!(
                "{} references unknown issuer {}",
                node.id, node.issuer_id
            ))
        })?;
        if !issuer.can_issue() {
            return Err(Error::Snapshot(format!(
                "{} was issued by {} which cannot sign",
                node.id, issuer.id
            )));
        }
        if node.kind == NodeKind::Authority && node.path_limit + 1 != issuer.path_limit {
            return Err(Error::Snapshot(format!(
                "{} has path limit {} under issuer limit {}",
                node.id, node.path_limit, issuer.path_limit
            )));
        }
        Ok(())
    }
}

impl Default for HierarchyIndex {
    fn default() -> Self {
        Self::new()
    }
}
