#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;

use certree::{
    Artifact, ArtifactFormat, ArtifactKind, CancelToken, CryptoEngine, Error, HierarchyIndex,
    IssuerCredentials, NodeRecord, RevocationReason, Result, Step,
};

/// One engine call as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub step: Step,
    pub node: String,
    /// `signer#serial` for certificates, `signer:reason` for revocations and
    /// the chain for bundles.
    pub detail: String,
}

/// Engine that records every call and fails chosen (node, step) pairs.
#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<(String, Step)>>,
    cancel_on: Mutex<Option<(String, Step, CancelToken)>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, node: &str, step: Step) {
        self.failing.lock().insert((node.to_string(), step));
    }

    pub fn heal(&self, node: &str, step: Step) {
        self.failing.lock().remove(&(node.to_string(), step));
    }

    /// Fires `token` once the engine has been called for `node` and `step`.
    pub fn cancel_after(&self, node: &str, step: Step, token: CancelToken) {
        *self.cancel_on.lock() = Some((node.to_string(), step, token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, step: Step) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.step == step)
            .map(|c| c.node.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, step: Step, node: &str, detail: String) -> Result<()> {
        self.calls.lock().push(Call {
            step,
            node: node.to_string(),
            detail,
        });
        if let Some((n, s, token)) = self.cancel_on.lock().as_ref() {
            if n == node && *s == step {
                token.cancel();
            }
        }
        if self.failing.lock().contains(&(node.to_string(), step)) {
            return Err(Error::CertGen(format!("injected failure on {}", node)));
        }
        Ok(())
    }
}

fn handle(kind: ArtifactKind, format: ArtifactFormat, node: &str) -> Artifact {
    Artifact::new(kind, format, format!("mock/{}.{}", node, kind.extension()))
}

/// Node id encoded in a mock artifact location.
pub fn owner(artifact: &Artifact) -> String {
    artifact
        .location
        .trim_start_matches("mock/")
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

impl CryptoEngine for RecordingEngine {
    fn generate_key(&self, node: &NodeRecord) -> Result<Artifact> {
        self.record(Step::Key, node.id(), String::new())?;
        Ok(handle(ArtifactKind::Key, ArtifactFormat::Pem, node.id()))
    }

    fn generate_request(&self, node: &NodeRecord) -> Result<Artifact> {
        self.record(Step::Request, node.id(), String::new())?;
        Ok(handle(ArtifactKind::Request, ArtifactFormat::Pem, node.id()))
    }

    fn generate_certificate(
        &self,
        node: &NodeRecord,
        issuer: IssuerCredentials<'_>,
        serial: u64,
    ) -> Result<Artifact> {
        let signer = owner(issuer.key);
        self.record(Step::Certificate, node.id(), format!("{}#{}", signer, serial))?;
        Ok(handle(ArtifactKind::Certificate, ArtifactFormat::Pem, node.id()))
    }

    fn generate_revocation_list(
        &self,
        node: &NodeRecord,
        existing: Option<&Artifact>,
    ) -> Result<Artifact> {
        let detail = existing.map(|_| "renewed".to_string()).unwrap_or_default();
        self.record(Step::RevocationList, node.id(), detail)?;
        Ok(handle(ArtifactKind::RevocationList, ArtifactFormat::Pem, node.id()))
    }

    fn revoke(
        &self,
        certificate: &Artifact,
        issuer: IssuerCredentials<'_>,
        reason: RevocationReason,
    ) -> Result<()> {
        let signer = owner(issuer.key);
        self.record(Step::Revoke, &owner(certificate), format!("{}:{}", signer, reason))
    }

    fn generate_bundle(&self, node: &NodeRecord, chain: &[Artifact]) -> Result<Artifact> {
        let chain: Vec<String> = chain.iter().map(owner).collect();
        self.record(Step::Bundle, node.id(), chain.join(">"))?;
        Ok(handle(ArtifactKind::Bundle, ArtifactFormat::Pkcs12, node.id()))
    }

    fn convert_format(&self, artifact: &Artifact, target: ArtifactFormat) -> Result<Artifact> {
        self.record(Step::Convert, &owner(artifact), format!("{:?}", target))?;
        Ok(handle(artifact.kind, target, &owner(artifact)))
    }
}

/// Scenario B: `R` (path limit 2) issues `M`, which issues `L`.
pub fn chain_r_m_l() -> HierarchyIndex {
    let mut index = HierarchyIndex::with_id("scenario-b");
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
}

/// Scenario B plus a sibling end-entity `E` under `R` and a second leaf `L2`
/// under `M`.
pub fn wide_tree() -> HierarchyIndex {
    let mut index = chain_r_m_l();
    index
        .insert(NodeRecord::end_entity("E").issued_by("R"))
        .unwrap();
    index
        .insert(NodeRecord::end_entity("L2").issued_by("M"))
        .unwrap();
    index
}
