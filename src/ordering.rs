//! Ordering of the issuance tree: the global issuer-first order, subtrees and
//! trust chains.
//!
//! Ties between nodes whose issuers are already placed are broken by
//! insertion sequence. Since an issuer must be inserted before anything it
//! signs, a well-formed index yields exactly its insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::hierarchy::HierarchyIndex;
use crate::node::NodeRecord;

impl HierarchyIndex {
    /// Every node id, each one after its issuer.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let position: HashMap<&str, usize> = self
            .insertion_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = self
            .nodes()
            .filter(|n| n.is_root())
            .filter_map(|n| position.get(n.id()).copied())
            .map(Reverse)
            .collect();

        let mut ordered = Vec::with_capacity(self.len());
        while let Some(Reverse(pos)) = ready.pop() {
            let id = &self.insertion_order[pos];
            ordered.push(id.clone());

            let Some(node) = self.get(id) else { continue };
            for child in node.signed_ids().iter().filter(|c| *c != id) {
                let is_child = self.get(child).is_some_and(|c| c.issuer_id() == id);
                if let (true, Some(p)) = (is_child, position.get(child.as_str())) {
                    ready.push(Reverse(*p));
                }
            }
        }

        if ordered.len() != self.len() {
            return Err(Error::Cycle {
                placed: ordered.len(),
                total: self.len(),
            });
        }
        Ok(ordered)
    }

    /// Topological order split into depth wavefronts: roots, then everything
    /// they issued, and so on. No node shares a layer with its issuer.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        let mut depth: HashMap<String, usize> = HashMap::new();
        let mut layers: Vec<Vec<String>> = Vec::new();

        for id in self.topological_order()? {
            let Some(node) = self.get(&id) else { continue };
            let d = if node.is_root() {
                0
            } else {
                depth.get(node.issuer_id()).map_or(0, |d| d + 1)
            };
            if layers.len() <= d {
                layers.resize_with(d + 1, Vec::new);
            }
            layers[d].push(id.clone());
            depth.insert(id, d);
        }

        Ok(layers)
    }

    /// Everything transitively issued by `id`, issuer before subject, without
    /// duplicates. A missing id yields an empty list.
    pub fn subtree(&self, id: &str, include_self: bool) -> Vec<String> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }

        let mut seen = HashSet::new();
        seen.insert(id.to_string());
        if include_self {
            out.push(id.to_string());
        }
        self.collect_descendants(id, &mut seen, &mut out);
        out
    }

    fn collect_descendants(&self, id: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        let Some(node) = self.get(id) else { return };
        for child in node.signed_ids() {
            if child == id || !seen.insert(child.clone()) {
                continue;
            }
            out.push(child.clone());
            self.collect_descendants(child, seen, out);
        }
    }

    /// `[id, issuer(id), ..., root]`. Empty when `id` is not in the index.
    pub fn trust_chain(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = match self.get(id) {
            Some(node) => node,
            None => return chain,
        };

        chain.push(current.id().to_string());
        while !current.is_root() && chain.len() <= self.len() {
            match self.get(current.issuer_id()) {
                Some(issuer) => {
                    chain.push(issuer.id().to_string());
                    current = issuer;
                }
                None => break,
            }
        }
        chain
    }

    /// True when `descendant` was issued, directly or not, by `ancestor`.
    /// A node is never its own descendant.
    pub fn is_descendant_of(&self, descendant: &str, ancestor: &str) -> bool {
        descendant != ancestor
            && self.contains(ancestor)
            && self
                .trust_chain(descendant)
                .iter()
                .skip(1)
                .any(|id| id == ancestor)
    }

    /// Record form of [`is_descendant_of`](Self::is_descendant_of): both
    /// records must belong to this index and differ in some attribute.
    pub fn is_beneath(&self, a: &NodeRecord, b: &NodeRecord) -> bool {
        a != b
            && a.hierarchy_id() == Some(self.id())
            && b.hierarchy_id() == Some(self.id())
            && self.is_descendant_of(a.id(), b.id())
    }

    pub fn contains_in_subtree(&self, root: &str, id: &str) -> bool {
        (root == id && self.contains(id)) || self.is_descendant_of(id, root)
    }

    /// The record for `id` if it lies in the subtree of `root`, root included.
    pub fn subtree_member(&self, root: &str, id: &str) -> Option<&NodeRecord> {
        if self.contains_in_subtree(root, id) {
            self.get(id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRecord;

    fn index() -> HierarchyIndex {
        let mut index = HierarchyIndex::new();
        index
            .insert(NodeRecord::authority("R").with_path_limit(2))
            .unwrap();
        index
            .insert(NodeRecord::authority("M").issued_by("R"))
            .unwrap();
        index
            .insert(NodeRecord::end_entity("L").issued_by("M"))
            .unwrap();
        index
            .insert(NodeRecord::end_entity("E").issued_by("R"))
            .unwrap();
        index
            .insert(NodeRecord::authority("R2").with_path_limit(1))
            .unwrap();
        index
            .insert(NodeRecord::end_entity("L2").issued_by("M"))
            .unwrap();
        index
    }

    #[test]
    fn test_topological_order_follows_insertion() {
        let index = index();
        let order = index.topological_order().unwrap();
        assert_eq!(order, ["R", "M", "L", "E", "R2", "L2"]);
        assert_eq!(order, index.topological_order().unwrap());
    }

    #[test]
    fn test_layers() {
        let layers = index().layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], ["R", "R2"]);
        assert_eq!(layers[1], ["M", "E"]);
        assert_eq!(layers[2], ["L", "L2"]);
    }

    #[test]
    fn test_subtree() {
        let index = index();
        assert_eq!(index.subtree("R", true), ["R", "M", "L", "L2", "E"]);
        assert_eq!(index.subtree("M", false), ["L", "L2"]);
        assert!(index.subtree("L", false).is_empty());
        assert!(index.subtree("ghost", true).is_empty());
    }

    #[test]
    fn test_trust_chain() {
        let index = index();
        assert_eq!(index.trust_chain("L"), ["L", "M", "R"]);
        assert_eq!(index.trust_chain("R"), ["R"]);
        assert!(index.trust_chain("ghost").is_empty());
    }

    #[test]
    fn test_descendant_relation() {
        let index = index();
        assert!(index.is_descendant_of("L", "R"));
        assert!(index.is_descendant_of("L", "M"));
        assert!(!index.is_descendant_of("R", "L"));
        assert!(!index.is_descendant_of("R", "R"));
        assert!(!index.is_descendant_of("L2", "R2"));

        let l = index.get("L").unwrap();
        let r = index.get("R").unwrap();
        assert!(index.is_beneath(l, r));
        assert!(!index.is_beneath(r, l));
        assert!(!index.is_beneath(r, r));
    }

    #[test]
    fn test_subtree_member() {
        let index = index();
        assert!(index.subtree_member("M", "L").is_some());
        assert!(index.subtree_member("M", "M").is_some());
        assert!(index.subtree_member("M", "E").is_none());
        assert!(index.contains_in_subtree("R", "L2"));
    }

    #[test]
    fn test_corrupted_index_reports_cycle() {
        let mut index = index();
        // M now claims its own child as issuer: M, L and L2 become unreachable.
        index.node_mut("M").unwrap().issuer_id = "L".to_string();
        let err = index.topological_order().unwrap_err();
        assert!(matches!(err, Error::Cycle { placed: 3, total: 6 }));
    }
}
