//! Node records: one certificate authority or end-entity of a hierarchy.
//!
//! A record is built detached, configured with the builder methods below and
//! then handed to [`HierarchyIndex::insert`](crate::HierarchyIndex::insert).
//! Structural attributes (`id`, `kind`, `issuer_id`, `path_limit`) can only be
//! set on a detached record; once inserted the index owns the record and only
//! exposes its [`Policy`] for mutation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    Artifact, ArtifactKind, Digest, DistinguishedName, KeySpec, NodeKind, Status, SubjectAltName,
};

/// Issuance policy of a node. These attributes only matter to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub key: KeySpec,
    pub subject: DistinguishedName,
    pub san: SubjectAltName,
    pub life: u32,
    pub crl_life: u32,
    pub request_digest: Digest,
    pub certificate_digest: Digest,
    pub crl_digest: Digest,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_responders: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            key: KeySpec::default(),
            subject: DistinguishedName::default(),
            san: SubjectAltName::new(),
            life: 1,
            crl_life: 1,
            request_digest: Digest::default(),
            certificate_digest: Digest::default(),
            crl_digest: Digest::default(),
            crl_distribution_points: Vec::new(),
            ocsp_responders: Vec::new(),
        }
    }
}

impl Policy {
    /// Certificate validity in days. Values below 1 are ignored.
    pub fn set_life(&mut self, days: u32) -> bool {
        if days < 1 {
            return false;
        }
        self.life = days;
        true
    }

    /// Revocation-list validity in days, bounded by `1..=life`.
    pub fn set_crl_life(&mut self, days: u32) -> bool {
        if !(1..=self.life).contains(&days) {
            return false;
        }
        self.crl_life = days;
        true
    }

    pub fn set_key(&mut self, key: KeySpec) -> bool {
        if !key.is_supported() {
            return false;
        }
        self.key = key;
        true
    }

    pub fn set_subject(&mut self, subject: DistinguishedName) {
        self.subject = subject;
    }

    pub fn set_subject_alt_names(&mut self, list: &str) {
        self.san = SubjectAltName::parse(list);
    }

    /// Comma separated URIs; an empty string clears the list.
    pub fn set_crl_distribution_points(&mut self, uris: &str) {
        self.crl_distribution_points = split_uris(uris);
    }

    pub fn set_ocsp_responders(&mut self, uris: &str) {
        self.ocsp_responders = split_uris(uris);
    }
}

fn split_uris(uris: &str) -> Vec<String> {
    uris.to_lowercase()
        .replace(' ', "")
        .split(',')
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// Handles to the artifacts produced for a node so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub key: Option<Artifact>,
    pub request: Option<Artifact>,
    pub certificate: Option<Artifact>,
    pub revocation_list: Option<Artifact>,
    pub bundle: Option<Artifact>,
}

impl Artifacts {
    pub fn get(&self, kind: ArtifactKind) -> Option<&Artifact> {
        match kind {
            ArtifactKind::Key => self.key.as_ref(),
            ArtifactKind::Request => self.request.as_ref(),
            ArtifactKind::Certificate => self.certificate.as_ref(),
            ArtifactKind::RevocationList => self.revocation_list.as_ref(),
            ArtifactKind::Bundle => self.bundle.as_ref(),
        }
    }

    /// Drops every handle that `status` says has not been produced yet.
    pub fn clear_for(&mut self, status: Status) {
        if status <= Status::AwaitingKey {
            self.key = None;
        }
        if status <= Status::AwaitingRequest {
            self.request = None;
        }
        if status <= Status::AwaitingCertificate {
            self.certificate = None;
            self.bundle = None;
        }
        if status <= Status::AwaitingRevocationList {
            self.revocation_list = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub(crate) id: String,
    pub(crate) kind: NodeKind,
    pub(crate) issuer_id: String,
    pub(crate) path_limit: u32,
    pub(crate) signed_ids: Vec<String>,
    pub(crate) status: Status,
    pub(crate) hierarchy: Option<String>,
    pub(crate) policy: Policy,
    pub(crate) artifacts: Artifacts,
}

impl NodeRecord {
    /// A detached, self-issued record. Call [`issued_by`](Self::issued_by) to
    /// place it under another node.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            issuer_id: id.clone(),
            id,
            kind,
            path_limit: 0,
            signed_ids: Vec::new(),
            status: Status::AwaitingKey,
            hierarchy: None,
            policy: Policy::default(),
            artifacts: Artifacts::default(),
        }
    }

    pub fn authority(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Authority)
    }

    pub fn end_entity(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::EndEntity)
    }

    /// A record with a random UUID identifier.
    pub fn generated(kind: NodeKind) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.is_root() {
            self.issuer_id = id.clone();
        }
        self.id = id;
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        if kind == NodeKind::EndEntity {
            self.signed_ids.clear();
        }
        self
    }

    pub fn issued_by(mut self, issuer: impl Into<String>) -> Self {
        self.issuer_id = issuer.into();
        self
    }

    /// Only meaningful for roots; every other node derives it from its issuer.
    pub fn with_path_limit(mut self, path_limit: u32) -> Self {
        self.path_limit = path_limit;
        self
    }

    pub fn with_key(mut self, key: KeySpec) -> Self {
        self.policy.set_key(key);
        self
    }

    pub fn with_subject(mut self, subject: DistinguishedName) -> Self {
        self.policy.set_subject(subject);
        self
    }

    pub fn with_san(mut self, san: SubjectAltName) -> Self {
        self.policy.san = san;
        self
    }

    pub fn with_life(mut self, days: u32) -> Self {
        self.policy.set_life(days);
        self
    }

    pub fn with_crl_life(mut self, days: u32) -> Self {
        self.policy.set_crl_life(days);
        self
    }

    pub fn with_digests(mut self, request: Digest, certificate: Digest, crl: Digest) -> Self {
        self.policy.request_digest = request;
        self.policy.certificate_digest = certificate;
        self.policy.crl_digest = crl;
        self
    }

    pub fn with_crl_distribution_points(mut self, uris: &str) -> Self {
        self.policy.set_crl_distribution_points(uris);
        self
    }

    pub fn with_ocsp_responders(mut self, uris: &str) -> Self {
        self.policy.set_ocsp_responders(uris);
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn path_limit(&self) -> u32 {
        self.path_limit
    }

    pub fn signed_ids(&self) -> &[String] {
        &self.signed_ids
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Id of the hierarchy this record was inserted into.
    pub fn hierarchy_id(&self) -> Option<&str> {
        self.hierarchy.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.hierarchy.is_some()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    pub fn is_root(&self) -> bool {
        self.id == self.issuer_id
    }

    /// Authorities with remaining path length may sign others and keep a
    /// revocation list.
    pub fn can_issue(&self) -> bool {
        self.kind == NodeKind::Authority && self.path_limit > 0
    }

    pub fn needs_revocation_list(&self) -> bool {
        self.can_issue()
    }

    pub(crate) fn advance(&mut self, status: Status) {
        debug!(node = %self.id, from = ?self.status, to = ?status, "Status advanced");
        self.status = status;
    }

    pub(crate) fn reset(&mut self, status: Status) {
        self.status = status;
        self.artifacts.clear_for(status);
    }

    /// Status after a successful certificate issuance.
    pub(crate) fn status_after_certificate(&self) -> Status {
        if self.needs_revocation_list() {
            Status::AwaitingRevocationList
        } else {
            Status::Complete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactFormat;

    #[test]
    fn test_defaults() {
        let node = NodeRecord::authority("root");
        assert!(node.is_root());
        assert_eq!(node.status(), Status::AwaitingKey);
        assert_eq!(node.policy().life, 1);
        assert_eq!(node.policy().key, KeySpec::Rsa(2048));
        assert!(!node.is_attached());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = NodeRecord::generated(NodeKind::Authority);
        let b = NodeRecord::generated(NodeKind::Authority);
        assert_ne!(a.id(), b.id());
        assert!(a.is_root());
    }

    #[test]
    fn test_with_id_keeps_root_self_issued() {
        let node = NodeRecord::authority("a").with_id("b");
        assert_eq!(node.issuer_id(), "b");

        let child = NodeRecord::end_entity("c").issued_by("b").with_id("d");
        assert_eq!(child.issuer_id(), "b");
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = Policy::default();
        assert!(!policy.set_life(0));
        assert!(policy.set_life(30));
        assert!(!policy.set_crl_life(31));
        assert!(policy.set_crl_life(7));
        assert_eq!(policy.crl_life, 7);
        assert!(!policy.set_key(KeySpec::Rsa(1024)));
        assert_eq!(policy.key, KeySpec::Rsa(2048));
    }

    #[test]
    fn test_uri_lists() {
        let node = NodeRecord::authority("r")
            .with_crl_distribution_points("HTTP://crl.example/a.crl, http://crl.example/b.crl");
        assert_eq!(
            node.policy().crl_distribution_points,
            vec!["http://crl.example/a.crl", "http://crl.example/b.crl"]
        );
    }

    #[test]
    fn test_clear_for_status() {
        let handle = |kind| Some(Artifact::new(kind, ArtifactFormat::Pem, "x"));
        let mut artifacts = Artifacts {
            key: handle(ArtifactKind::Key),
            request: handle(ArtifactKind::Request),
            certificate: handle(ArtifactKind::Certificate),
            revocation_list: handle(ArtifactKind::RevocationList),
            bundle: handle(ArtifactKind::Bundle),
        };

        artifacts.clear_for(Status::AwaitingCertificate);
        assert!(artifacts.key.is_some());
        assert!(artifacts.request.is_some());
        assert!(artifacts.certificate.is_none());
        assert!(artifacts.bundle.is_none());
        assert!(artifacts.revocation_list.is_none());

        artifacts.clear_for(Status::AwaitingKey);
        assert_eq!(artifacts, Artifacts::default());
    }
}
