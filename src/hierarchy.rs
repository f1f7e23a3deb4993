//! Reconstruction of certificate parent/child trees.
//!
//! The store frequently receives unordered bags of certificates (bundle files,
//! received chains, trust anchors). [`CertificateHierarchy`] rebuilds the
//! forest: self-signed certificates become roots, issued certificates hang off
//! the certificate that actually signed them, and anything whose issuer is not
//! in the bag stays at the top level as an orphan.
//!
//! Nodes own their children; each node stores a *clone* of its issuer
//! certificate rather than a back-pointer, so the forest stays acyclic.

use std::collections::VecDeque;

use tracing::warn;

use crate::certificate::Certificate;
use crate::types::CertificateHashData;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeState {
    pub is_selfsigned: bool,
    /// Set during the final prune when no issuer could be found. A top-level
    /// non-self-signed node without this flag is a temporary orphan awaiting
    /// the prune.
    pub is_orphan: bool,
}

#[derive(Debug, Clone)]
pub struct CertificateNode {
    pub state: NodeState,
    pub certificate: Certificate,
    /// Present exactly when the issuer is known: self-hash for roots, hash
    /// against the actual parent for issued certificates.
    pub hash: Option<CertificateHashData>,
    /// Copy of the issuer certificate; for roots this is the certificate
    /// itself.
    pub issuer: Certificate,
    pub children: Vec<CertificateNode>,
}

/// Hash of an issued certificate computed against its (already verified)
/// issuer.
fn issued_hash(certificate: &Certificate, issuer: &Certificate) -> CertificateHashData {
    CertificateHashData {
        hash_algorithm: crate::types::HashAlgorithm::Sha256,
        issuer_name_hash: certificate.issuer_name_hash(),
        issuer_key_hash: issuer.key_hash(),
        serial_number: certificate.serial_number(),
    }
}

#[derive(Debug, Default)]
pub struct CertificateHierarchy {
    hierarchy: Vec<CertificateNode>,
}

enum TopLevelLink {
    ParentOfTop(usize),
    ChildOfTop(usize),
}

impl CertificateHierarchy {
    /// Builds the forest from a single bag of certificates.
    pub fn build(certificates: Vec<Certificate>) -> Self {
        Self::build_merged(certificates, Vec::new())
    }

    /// Builds the forest from trust anchors plus candidates. Either set may be
    /// empty; earlier call sites merged both into one bag and the builder
    /// accepts both shapes.
    pub fn build_merged(trust: Vec<Certificate>, candidates: Vec<Certificate>) -> Self {
        let mut ordered = CertificateHierarchy::default();

        for certificate in trust.into_iter().chain(candidates) {
            ordered.insert(certificate);
        }

        ordered.prune();
        ordered
    }

    pub fn get_hierarchy(&self) -> &[CertificateNode] {
        &self.hierarchy
    }

    fn insert(&mut self, certificate: Certificate) {
        if !certificate.is_selfsigned() {
            let mut new_node = CertificateNode {
                state: NodeState::default(),
                issuer: certificate.clone(),
                certificate,
                hash: None,
                children: Vec::new(),
            };

            // At most one link is made per insert; the first match wins
            let mut link = None;
            for (i, top) in self.hierarchy.iter().enumerate() {
                if top.certificate.is_child(&new_node.certificate) {
                    link = Some(TopLevelLink::ParentOfTop(i));
                    break;
                }
                if new_node.certificate.is_child(&top.certificate) {
                    link = Some(TopLevelLink::ChildOfTop(i));
                    break;
                }
            }

            match link {
                Some(TopLevelLink::ParentOfTop(i)) => {
                    let mut old_top = self.hierarchy.remove(i);

                    debug_assert!(
                        !old_top.state.is_selfsigned,
                        "a new certificate cannot parent a self-signed root"
                    );
                    debug_assert!(
                        old_top.hash.is_none(),
                        "an unparented top-level certificate cannot hold a hash"
                    );

                    old_top.state = NodeState::default();
                    old_top.hash = Some(issued_hash(&old_top.certificate, &new_node.certificate));
                    old_top.issuer = new_node.certificate.clone();

                    new_node.children.push(old_top);
                    self.hierarchy.insert(i, new_node);
                }
                Some(TopLevelLink::ChildOfTop(i)) => {
                    let top = &mut self.hierarchy[i];
                    new_node.hash = Some(issued_hash(&new_node.certificate, &top.certificate));
                    new_node.issuer = top.certificate.clone();
                    top.children.push(new_node);
                }
                None => self.hierarchy.push(new_node),
            }

            return;
        }

        // Self-signed: append as a root with its self-hash
        let hash = certificate.hash_data();
        self.hierarchy.push(CertificateNode {
            state: NodeState {
                is_selfsigned: true,
                is_orphan: false,
            },
            issuer: certificate.clone(),
            certificate,
            hash: Some(hash),
            children: Vec::new(),
        });

        // Partial prune: adopt any existing top-level orphan issued by the new
        // root. The new root stays the last element while earlier entries are
        // removed.
        let mut i = 0;
        while i + 1 < self.hierarchy.len() {
            if self.hierarchy[i].state.is_selfsigned {
                i += 1;
                continue;
            }

            debug_assert!(
                self.hierarchy[i].hash.is_none(),
                "an orphan certificate cannot hold a hash"
            );

            let root_index = self.hierarchy.len() - 1;
            let adopted = self.hierarchy[i]
                .certificate
                .is_child(&self.hierarchy[root_index].certificate);

            if adopted {
                let mut node = self.hierarchy.remove(i);
                let root_index = self.hierarchy.len() - 1;
                let root_certificate = self.hierarchy[root_index].certificate.clone();

                node.hash = Some(issued_hash(&node.certificate, &root_certificate));
                node.state.is_orphan = false;
                node.issuer = root_certificate;

                self.hierarchy[root_index].children.push(node);
            } else {
                i += 1;
            }
        }
    }

    /// Final prune: re-parent temporary orphans anywhere in the forest, and
    /// mark the remainder as permanent orphans.
    fn prune(&mut self) {
        if self.hierarchy.len() <= 1 {
            return;
        }

        let mut i = 0;
        while i < self.hierarchy.len() {
            let node = &self.hierarchy[i];
            let temporary_orphan = !node.state.is_selfsigned && !node.state.is_orphan;
            if !temporary_orphan {
                i += 1;
                continue;
            }

            let orphan = self.hierarchy.remove(i);
            match Self::attach_to_issuer(&mut self.hierarchy, orphan) {
                Ok(()) => {
                    // Attached somewhere; the element at i is now a new node
                }
                Err(mut orphan) => {
                    orphan.state.is_orphan = true;
                    self.hierarchy.insert(i, orphan);
                    i += 1;
                }
            }
        }
    }

    /// Attaches `orphan` under the first node that issued it, searching the
    /// forest in pre-order. Hands the orphan back when no issuer exists.
    fn attach_to_issuer(
        nodes: &mut Vec<CertificateNode>,
        orphan: CertificateNode,
    ) -> Result<(), CertificateNode> {
        let mut orphan = orphan;

        for node in nodes.iter_mut() {
            if orphan.certificate.is_child(&node.certificate) {
                orphan.hash = Some(issued_hash(&orphan.certificate, &node.certificate));
                orphan.state.is_orphan = false;
                orphan.issuer = node.certificate.clone();
                node.children.push(orphan);
                return Ok(());
            }

            match Self::attach_to_issuer(&mut node.children, orphan) {
                Ok(()) => return Ok(()),
                Err(handed_back) => orphan = handed_back,
            }
        }

        Err(orphan)
    }

    /// Breadth-first walk over every node; stops when `visit` returns false.
    pub fn for_each<'a>(&'a self, mut visit: impl FnMut(&'a CertificateNode) -> bool) {
        let mut queue: VecDeque<&CertificateNode> = self.hierarchy.iter().collect();

        while let Some(node) = queue.pop_front() {
            if !visit(node) {
                return;
            }
            queue.extend(node.children.iter());
        }
    }

    /// Depth-first walk over the descendants of `node`, excluding the node
    /// itself. `depth` starts at the given base.
    pub fn for_each_descendant<'a>(
        node: &'a CertificateNode,
        base_depth: usize,
        visit: &mut impl FnMut(&'a CertificateNode, usize),
    ) {
        for child in &node.children {
            visit(child, base_depth);
            Self::for_each_descendant(child, base_depth + 1, visit);
        }
    }

    /// True when the certificate is a self-signed root contained at the top
    /// level of this hierarchy.
    pub fn is_internal_root(&self, certificate: &Certificate) -> bool {
        certificate.is_selfsigned()
            && self
                .hierarchy
                .iter()
                .any(|node| node.certificate == *certificate)
    }

    /// Collects all descendants of `top` in pre-order, excluding `top`.
    pub fn collect_descendants(&self, top: &Certificate) -> Vec<Certificate> {
        let mut descendants = Vec::new();

        self.for_each(|node| {
            if node.certificate == *top {
                Self::for_each_descendant(node, 0, &mut |descendant, _| {
                    descendants.push(descendant.certificate.clone());
                });
                return false;
            }
            true
        });

        descendants
    }

    /// Collects every node strictly shallower than `leaf` inside the root
    /// sub-tree containing it; the chain from below the root down to just
    /// above the leaf.
    pub fn collect_top(&self, leaf: &Certificate) -> Vec<Certificate> {
        let Some((root, found_depth)) = self.find_certificate_root_node(leaf) else {
            return Vec::new();
        };

        let mut top_nodes = Vec::new();
        Self::for_each_descendant(root, 1, &mut |node, depth| {
            if depth < found_depth {
                top_nodes.push(node.certificate.clone());
            }
        });

        top_nodes
    }

    /// Hash of the certificate, resolving its issuer through the hierarchy.
    /// Self-signed certificates answer directly from their own data.
    pub fn get_certificate_hash(&self, certificate: &Certificate) -> Option<CertificateHashData> {
        if certificate.is_selfsigned() {
            return Some(certificate.hash_data());
        }

        let mut found = None;
        self.for_each(|node| {
            if node.certificate == *certificate && node.hash.is_some() {
                found = node.hash.clone();
                return false;
            }
            true
        });

        if found.is_none() {
            warn!(
                "Could not find owner for certificate: {}",
                certificate.common_name()
            );
        }

        found
    }

    pub fn contains_certificate_hash(
        &self,
        hash: &CertificateHashData,
        case_insensitive: bool,
    ) -> bool {
        let mut contains = false;

        self.for_each(|node| {
            if let Some(node_hash) = &node.hash {
                let matches = if case_insensitive {
                    node_hash.case_insensitive_eq(hash)
                } else {
                    node_hash == hash
                };

                if matches {
                    contains = true;
                    return false;
                }
            }
            true
        });

        contains
    }

    /// Root certificate of the sub-tree containing `leaf`.
    pub fn find_certificate_root(&self, leaf: &Certificate) -> Option<Certificate> {
        self.find_certificate_root_node(leaf)
            .map(|(root, _)| root.certificate.clone())
    }

    /// Root node of the sub-tree containing `leaf`, plus the leaf's depth
    /// below that root (1 = direct child).
    pub fn find_certificate_root_node(
        &self,
        leaf: &Certificate,
    ) -> Option<(&CertificateNode, usize)> {
        let mut result = None;

        for root in &self.hierarchy {
            if !root.state.is_selfsigned {
                continue;
            }

            Self::for_each_descendant(root, 1, &mut |node, depth| {
                if node.certificate == *leaf {
                    result = Some((root, depth));
                }
            });
        }

        result
    }

    /// First certificate whose hash matches the query.
    pub fn find_certificate(
        &self,
        hash: &CertificateHashData,
        case_insensitive: bool,
    ) -> Option<Certificate> {
        let mut found = None;

        self.for_each(|node| {
            if let Some(node_hash) = &node.hash {
                let matches = if case_insensitive {
                    node_hash.case_insensitive_eq(hash)
                } else {
                    node_hash == hash
                };

                if matches {
                    found = Some(node.certificate.clone());
                    return false;
                }
            }
            true
        });

        found
    }

    /// All certificates matching the hash. A sub-CA can legitimately appear in
    /// several bundles at once.
    pub fn find_certificates_multi(&self, hash: &CertificateHashData) -> Vec<Certificate> {
        let mut certificates = Vec::new();

        self.for_each(|node| {
            if node.hash.as_ref() == Some(hash) {
                certificates.push(node.certificate.clone());
            }
            true
        });

        certificates
    }

    pub fn to_debug_string(&self) -> String {
        let mut out = String::new();

        for root in &self.hierarchy {
            if root.state.is_selfsigned {
                out.push_str("* [ROOT]");
            } else {
                out.push_str("+ [ORPH]");
            }
            out.push(' ');
            out.push_str(&root.certificate.common_name());
            out.push('\n');

            Self::for_each_descendant(root, 1, &mut |node, depth| {
                for _ in 0..depth {
                    out.push_str("---");
                }
                out.push(' ');
                out.push_str(&node.certificate.common_name());
                out.push('\n');
            });
        }

        out
    }

    /// Total node count, mostly for diagnostics and tests.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.for_each(|_| {
            count += 1;
            true
        });
        count
    }
}
