//! The boundary to whatever actually produces keys, requests, certificates,
//! revocation lists and bundles.
//!
//! The hierarchy core never encodes or signs anything itself. It hands a node
//! to the engine, gets an [`Artifact`] handle back and records it. A failing
//! call leaves the node exactly as it was.

use crate::error::Result;
use crate::node::NodeRecord;
use crate::types::{Artifact, ArtifactFormat, RevocationReason};

/// Credentials of the node that signs. `certificate` is `None` when the
/// subject signs itself.
#[derive(Debug, Clone, Copy)]
pub struct IssuerCredentials<'a> {
    pub key: &'a Artifact,
    pub certificate: Option<&'a Artifact>,
}

impl<'a> IssuerCredentials<'a> {
    pub fn self_signed(key: &'a Artifact) -> Self {
        Self {
            key,
            certificate: None,
        }
    }

    pub fn issuer(key: &'a Artifact, certificate: &'a Artifact) -> Self {
        Self {
            key,
            certificate: Some(certificate),
        }
    }
}

pub trait CryptoEngine: Send + Sync {
    fn generate_key(&self, node: &NodeRecord) -> Result<Artifact>;

    /// Uses the node's key handle.
    fn generate_request(&self, node: &NodeRecord) -> Result<Artifact>;

    /// Signs the node's stored request. The request must match the node's
    /// key.
    fn generate_certificate(
        &self,
        node: &NodeRecord,
        issuer: IssuerCredentials<'_>,
        serial: u64,
    ) -> Result<Artifact>;

    /// Signs a fresh list with the node's key. When `existing` is given the
    /// engine keeps it under a backup name.
    fn generate_revocation_list(
        &self,
        node: &NodeRecord,
        existing: Option<&Artifact>,
    ) -> Result<Artifact>;

    fn revoke(
        &self,
        certificate: &Artifact,
        issuer: IssuerCredentials<'_>,
        reason: RevocationReason,
    ) -> Result<()>;

    /// `chain` holds certificate handles from the node up to its root.
    fn generate_bundle(&self, node: &NodeRecord, chain: &[Artifact]) -> Result<Artifact>;

    fn convert_format(&self, artifact: &Artifact, target: ArtifactFormat) -> Result<Artifact>;
}
