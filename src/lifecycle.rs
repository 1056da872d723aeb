//! Lifecycle controller: drives nodes through key, request, certificate and
//! revocation-list generation by calling a [`CryptoEngine`].
//!
//! Every step is split in two halves. The first reads the index, checks the
//! node's status and calls the engine; the second records the returned
//! handle and advances the status. Only the second half needs a mutable
//! index, which lets batch phases fan the first half out over a worker pool.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::batch::{run_pool, BatchReport};
use crate::config::BatchOptions;
use crate::engine::{CryptoEngine, IssuerCredentials};
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyIndex;
use crate::node::NodeRecord;
use crate::types::{
    Artifact, ArtifactFormat, ArtifactKind, NodeKind, RevocationReason, Status, Step,
};

pub struct Lifecycle<'e, E: CryptoEngine + ?Sized> {
    engine: &'e E,
}

impl<'e, E: CryptoEngine + ?Sized> Lifecycle<'e, E> {
    pub fn new(engine: &'e E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        self.engine
    }

    pub fn generate_key(&self, index: &mut HierarchyIndex, id: &str) -> Result<Artifact> {
        self.run_step(index, id, Step::Key)
    }

    pub fn generate_request(&self, index: &mut HierarchyIndex, id: &str) -> Result<Artifact> {
        self.run_step(index, id, Step::Request)
    }

    /// Issues the node's certificate with the next serial of the index. A root
    /// signs itself, every other node needs a certificate on its issuer.
    pub fn generate_certificate(&self, index: &mut HierarchyIndex, id: &str) -> Result<Artifact> {
        self.run_step(index, id, Step::Certificate)
    }

    /// Produces the node's revocation list. A node that keeps no list is moved
    /// to `Complete` without calling the engine and `None` is returned.
    pub fn generate_revocation_list(
        &self,
        index: &mut HierarchyIndex,
        id: &str,
    ) -> Result<Option<Artifact>> {
        let node = index.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        if node.status() == Status::AwaitingRevocationList && !node.needs_revocation_list() {
            complete_without_list(index, id);
            return Ok(None);
        }
        self.run_step(index, id, Step::RevocationList).map(Some)
    }

    /// Bundles the node's key with the certificates of its trust chain. The
    /// status is left as it is.
    pub fn generate_bundle(&self, index: &mut HierarchyIndex, id: &str) -> Result<Artifact> {
        self.run_step(index, id, Step::Bundle)
    }

    /// Re-encodes one of the node's artifacts. The node keeps its original
    /// handle; the converted one is returned to the caller.
    pub fn convert_format(
        &self,
        index: &HierarchyIndex,
        id: &str,
        kind: ArtifactKind,
        target: ArtifactFormat,
    ) -> Result<Artifact> {
        let node = index.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        let artifact = node
            .artifacts()
            .get(kind)
            .ok_or_else(|| Error::MissingArtifact(format!("{:?} of {}", kind, id)))?;
        self.engine
            .convert_format(artifact, target)
            .map_err(|e| Error::engine(id, Step::Convert, e))
    }

    /// Forces a node back (or forward) to `status`, dropping every handle
    /// the new status says has not been produced.
    pub fn set_status(&self, index: &mut HierarchyIndex, id: &str, status: Status) -> Result<()> {
        let node = index
            .node_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        debug!(node = %id, from = ?node.status(), to = ?status, "Status reset");
        node.reset(status);
        Ok(())
    }

    /// Brings every node as far through its lifecycle as possible.
    ///
    /// Engine failures are collected in the report and never stop the batch;
    /// the affected node keeps its status and can be retried by running the
    /// batch again. The only error returned is a corrupted index.
    pub fn batch_generate(
        &self,
        index: &mut HierarchyIndex,
        opts: &BatchOptions,
    ) -> Result<BatchReport> {
        self.run_batch(index, None, opts)
    }

    /// Bundles every node that has a certificate and no bundle yet.
    pub fn generate_bundles(&self, index: &mut HierarchyIndex, opts: &BatchOptions) -> BatchReport {
        let mut report = BatchReport::default();
        self.bundle_phase(index, None, opts, &mut report);
        report
    }

    /// Revokes the subtree of `id` leaves first, each certificate against its
    /// issuer, then regenerates a single revocation list: the target's own
    /// when the target is a spared authority, otherwise its issuer's. A
    /// holder that keeps no list is left alone.
    pub fn revoke(
        &self,
        index: &mut HierarchyIndex,
        id: &str,
        reason: RevocationReason,
        include_self: bool,
    ) -> Result<BatchReport> {
        let target = index.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        let list_holder = if !include_self && target.kind() == NodeKind::Authority {
            target.id().to_string()
        } else {
            target.issuer_id().to_string()
        };

        let mut report = BatchReport::default();
        let members = index.subtree(id, include_self);
        info!(node = %id, reason = %reason, members = members.len(), "Revoking branch");

        for member in members.iter().rev() {
            let Some(node) = index.get(member) else { continue };
            let Some(certificate) = node.artifacts().certificate.as_ref() else {
                debug!(node = %member, "No certificate to revoke");
                continue;
            };
            let result = issuer_credentials(index, node)
                .and_then(|issuer| {
                    self.engine
                        .revoke(certificate, issuer, reason)
                        .map_err(|e| Error::engine(member.as_str(), Step::Revoke, e))
                });
            match result {
                Ok(()) => report.record_success(member.as_str(), Step::Revoke),
                Err(e) => report.record_failure(member.as_str(), Step::Revoke, e),
            }
        }

        let holder_ready = index.get(&list_holder).is_some_and(|h| {
            h.needs_revocation_list() && h.status() >= Status::AwaitingRevocationList
        });
        if holder_ready {
            match self.run_step(index, &list_holder, Step::RevocationList) {
                Ok(_) => report.record_success(list_holder, Step::RevocationList),
                Err(e) => report.record_failure(list_holder, Step::RevocationList, e),
            }
        } else {
            debug!(node = %list_holder, "Revocation list not regenerated");
        }

        Ok(report)
    }

    /// Revokes a branch and issues it again from fresh keys. Bundles that
    /// existed before are regenerated.
    pub fn renew_branch(
        &self,
        index: &mut HierarchyIndex,
        id: &str,
        reason: RevocationReason,
        include_self: bool,
        opts: &BatchOptions,
    ) -> Result<BatchReport> {
        let mut report = self.revoke(index, id, reason, include_self)?;

        let members = index.subtree(id, include_self);
        let bundled: HashSet<String> = members
            .iter()
            .filter(|m| {
                index
                    .get(m)
                    .is_some_and(|n| n.artifacts().bundle.is_some())
            })
            .cloned()
            .collect();

        for member in &members {
            if let Some(node) = index.node_mut(member) {
                node.reset(Status::AwaitingKey);
            }
        }

        let scope: HashSet<String> = members.into_iter().collect();
        report.merge(self.run_batch(index, Some(&scope), opts)?);
        if !report.cancelled && !bundled.is_empty() {
            self.bundle_phase(index, Some(&bundled), opts, &mut report);
        }

        info!(node = %id, failures = report.failures.len(), "Branch renewed");
        Ok(report)
    }

    /// Regenerates the node's revocation list, keeping the previous one as a
    /// backup.
    ///
    /// `life` is capped at the certificate life; `None` uses the certificate
    /// life and a zero leaves the current value in place.
    pub fn renew_revocation_list(
        &self,
        index: &mut HierarchyIndex,
        id: &str,
        life: Option<u32>,
    ) -> Result<Artifact> {
        let node = index
            .node_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !node.needs_revocation_list() {
            return Err(Error::InvalidInput(format!(
                "{} does not keep a revocation list",
                id
            )));
        }

        require_at_least(node, Status::AwaitingRevocationList)?;

        let previous = node.policy.crl_life;
        let effective = match life {
            Some(0) => {
                debug!(node = %id, "Ignoring revocation list life below one day");
                previous
            }
            Some(days) => days.min(node.policy.life),
            None => node.policy.life,
        };
        node.policy.crl_life = effective;

        let result = self.run_step(index, id, Step::RevocationList);
        if result.is_err() {
            if let Some(node) = index.node_mut(id) {
                node.policy.crl_life = previous;
            }
        }
        result
    }

    fn run_step(&self, index: &mut HierarchyIndex, id: &str, step: Step) -> Result<Artifact> {
        let artifact = self.produce(index, id, step)?;
        commit(index, id, step, artifact.clone());
        Ok(artifact)
    }

    /// Checks preconditions and calls the engine. Never mutates the index
    /// beyond drawing a serial.
    fn produce(&self, index: &HierarchyIndex, id: &str, step: Step) -> Result<Artifact> {
        let node = index.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        let result = match step {
            Step::Key => {
                require_status(node, Status::AwaitingKey)?;
                self.engine.generate_key(node)
            }
            Step::Request => {
                require_status(node, Status::AwaitingRequest)?;
                self.engine.generate_request(node)
            }
            Step::Certificate => {
                require_status(node, Status::AwaitingCertificate)?;
                let issuer = issuer_credentials(index, node)?;
                self.engine
                    .generate_certificate(node, issuer, index.next_serial())
            }
            Step::RevocationList => {
                require_at_least(node, Status::AwaitingRevocationList)?;
                if !node.needs_revocation_list() {
                    return Err(Error::InvalidInput(format!(
                        "{} does not keep a revocation list",
                        id
                    )));
                }
                self.engine
                    .generate_revocation_list(node, node.artifacts().revocation_list.as_ref())
            }
            Step::Bundle => {
                require_at_least(node, Status::AwaitingRevocationList)?;
                let chain = index
                    .trust_chain(id)
                    .iter()
                    .map(|member| {
                        index
                            .get(member)
                            .and_then(|n| n.artifacts().certificate.clone())
                            .ok_or_else(|| {
                                Error::MissingArtifact(format!("certificate of {}", member))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.engine.generate_bundle(node, &chain)
            }
            Step::Revoke | Step::Convert => {
                return Err(Error::InvalidInput(format!("{} is not a generation step", step)))
            }
        };
        result.map_err(|e| Error::engine(id, step, e))
    }

    fn run_batch(
        &self,
        index: &mut HierarchyIndex,
        scope: Option<&HashSet<String>>,
        opts: &BatchOptions,
    ) -> Result<BatchReport> {
        let order = index.topological_order()?;
        let layers = index.layers()?;
        let in_scope = |id: &String| scope.map_or(true, |s| s.contains(id));
        let mut report = BatchReport::default();

        let keys = select(index, index.list_ids(), Status::AwaitingKey, &in_scope);
        info!(nodes = keys.len(), "Generating keys");
        self.run_phase(index, keys, Step::Key, opts, &mut report);
        if stop(opts, &mut report) {
            return Ok(report);
        }

        let requests = select(index, order.clone(), Status::AwaitingRequest, &in_scope);
        info!(nodes = requests.len(), "Generating requests");
        self.run_phase(index, requests, Step::Request, opts, &mut report);
        if stop(opts, &mut report) {
            return Ok(report);
        }

        info!(layers = layers.len(), "Issuing certificates");
        for layer in layers {
            let ready = select(index, layer, Status::AwaitingCertificate, &in_scope);
            self.run_phase(index, ready, Step::Certificate, opts, &mut report);
            if stop(opts, &mut report) {
                return Ok(report);
            }
        }

        let (lists, no_list): (Vec<String>, Vec<String>) =
            select(index, order, Status::AwaitingRevocationList, &in_scope)
                .into_iter()
                .partition(|id| index.get(id).is_some_and(NodeRecord::needs_revocation_list));
        for id in &no_list {
            complete_without_list(index, id);
        }
        info!(nodes = lists.len(), "Generating revocation lists");
        self.run_phase(index, lists, Step::RevocationList, opts, &mut report);
        if stop(opts, &mut report) {
            return Ok(report);
        }

        if opts.bundles {
            self.bundle_phase(index, scope, opts, &mut report);
        }

        info!(
            completed = report.completed.len(),
            failures = report.failures.len(),
            "Batch finished"
        );
        Ok(report)
    }

    fn bundle_phase(
        &self,
        index: &mut HierarchyIndex,
        scope: Option<&HashSet<String>>,
        opts: &BatchOptions,
        report: &mut BatchReport,
    ) {
        let ids: Vec<String> = index
            .nodes()
            .filter(|n| scope.map_or(true, |s| s.contains(n.id())))
            .filter(|n| n.status() >= Status::AwaitingRevocationList)
            .filter(|n| n.artifacts().bundle.is_none())
            .map(|n| n.id().to_string())
            .collect();
        info!(nodes = ids.len(), "Generating bundles");
        self.run_phase(index, ids, Step::Bundle, opts, report);
    }

    fn run_phase(
        &self,
        index: &mut HierarchyIndex,
        ids: Vec<String>,
        step: Step,
        opts: &BatchOptions,
        report: &mut BatchReport,
    ) {
        let dispatched = ids.len();
        let results = {
            let shared: &HierarchyIndex = index;
            run_pool(ids, opts.workers, &opts.cancel, |id| {
                self.produce(shared, id, step)
            })
        };
        if results.len() < dispatched {
            report.cancelled = true;
        }

        for (id, result) in results {
            match result {
                Ok(artifact) => {
                    commit(index, &id, step, artifact);
                    report.record_success(id, step);
                }
                Err(e) => report.record_failure(id, step, e),
            }
        }
    }
}

fn select(
    index: &HierarchyIndex,
    ids: Vec<String>,
    status: Status,
    in_scope: &impl Fn(&String) -> bool,
) -> Vec<String> {
    ids.into_iter()
        .filter(|id| in_scope(id))
        .filter(|id| index.get(id).is_some_and(|n| n.status() == status))
        .collect()
}

fn stop(opts: &BatchOptions, report: &mut BatchReport) -> bool {
    if opts.cancel.is_cancelled() {
        info!("Batch cancelled");
        report.cancelled = true;
    }
    report.cancelled
}

fn require_status(node: &NodeRecord, status: Status) -> Result<()> {
    if node.status() != status {
        return Err(Error::InvalidState {
            node: node.id().to_string(),
            status: node.status(),
        });
    }
    Ok(())
}

fn require_at_least(node: &NodeRecord, status: Status) -> Result<()> {
    if node.status() < status {
        return Err(Error::InvalidState {
            node: node.id().to_string(),
            status: node.status(),
        });
    }
    Ok(())
}

/// Key and certificate of whoever signs `node`. Roots sign with their own key.
fn issuer_credentials<'i>(
    index: &'i HierarchyIndex,
    node: &'i NodeRecord,
) -> Result<IssuerCredentials<'i>> {
    if node.is_root() {
        let key = node
            .artifacts()
            .key
            .as_ref()
            .ok_or_else(|| Error::MissingArtifact(format!("key of {}", node.id())))?;
        return Ok(IssuerCredentials::self_signed(key));
    }

    let issuer = index
        .get(node.issuer_id())
        .ok_or_else(|| Error::UnresolvedIssuer(node.issuer_id().to_string()))?;
    match (&issuer.artifacts().key, &issuer.artifacts().certificate) {
        (Some(key), Some(certificate)) => Ok(IssuerCredentials::issuer(key, certificate)),
        _ => Err(Error::MissingArtifact(format!(
            "credentials of issuer {}",
            issuer.id()
        ))),
    }
}

fn commit(index: &mut HierarchyIndex, id: &str, step: Step, artifact: Artifact) {
    let Some(node) = index.node_mut(id) else { return };
    match step {
        Step::Key => {
            node.artifacts.key = Some(artifact);
            node.advance(Status::AwaitingRequest);
        }
        Step::Request => {
            node.artifacts.request = Some(artifact);
            node.advance(Status::AwaitingCertificate);
        }
        Step::Certificate => {
            node.artifacts.certificate = Some(artifact);
            let next = node.status_after_certificate();
            node.advance(next);
        }
        Step::RevocationList => {
            node.artifacts.revocation_list = Some(artifact);
            node.advance(Status::Complete);
        }
        Step::Bundle => node.artifacts.bundle = Some(artifact),
        Step::Revoke | Step::Convert => {}
    }
}

fn complete_without_list(index: &mut HierarchyIndex, id: &str) {
    if let Some(node) = index.node_mut(id) {
        node.advance(Status::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::rcgen_engine::RcgenEngine;
    use crate::types::{DistinguishedName, KeySpec};
    use x509_parser::prelude::*;

    fn node(id: &str, kind: NodeKind) -> NodeRecord {
        NodeRecord::new(id, kind)
            .with_key(KeySpec::EcdsaP256)
            .with_subject(DistinguishedName::new(id).with_organization("certree"))
            .with_life(30)
            .with_crl_life(7)
    }

    fn scenario_b() -> HierarchyIndex {
        let mut index = HierarchyIndex::with_id("lifecycle");
        index
            .insert(node("R", NodeKind::Authority).with_path_limit(2))
            .unwrap();
        index
            .insert(node("M", NodeKind::Authority).issued_by("R"))
            .unwrap();
        index
            .insert(node("L", NodeKind::EndEntity).issued_by("M"))
            .unwrap();
        index
    }

    fn cert_der(engine: &RcgenEngine, artifact: &Artifact) -> Vec<u8> {
        let pem = engine.artifact_bytes(artifact).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem).unwrap();
        pem.contents
    }

    #[test]
    fn test_single_steps_advance_status() {
        let engine = RcgenEngine::default();
        let lifecycle = Lifecycle::new(&engine);
        let mut index = scenario_b();

        lifecycle.generate_key(&mut index, "R").unwrap();
        assert_eq!(index.get("R").unwrap().status(), Status::AwaitingRequest);

        let err = lifecycle.generate_certificate(&mut index, "R").unwrap_err();
        assert!(matches!(err, Error::InvalidState { status: Status::AwaitingRequest, .. }));

        lifecycle.generate_request(&mut index, "R").unwrap();
        lifecycle.generate_certificate(&mut index, "R").unwrap();
        assert_eq!(
            index.get("R").unwrap().status(),
            Status::AwaitingRevocationList
        );

        let list = lifecycle.generate_revocation_list(&mut index, "R").unwrap();
        assert!(list.is_some());
        assert_eq!(index.get("R").unwrap().status(), Status::Complete);
    }

    #[test]
    fn test_batch_builds_verifiable_chain() {
        let engine = RcgenEngine::default();
        let lifecycle = Lifecycle::new(&engine);
        let mut index = scenario_b();

        let report = lifecycle
            .batch_generate(&mut index, &BatchOptions::default())
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(index.nodes().all(|n| n.status() == Status::Complete));
        assert_eq!(report.completed_steps(Step::RevocationList), ["R", "M"]);

        let m_der = cert_der(&engine, index.get("M").unwrap().artifacts().certificate.as_ref().unwrap());
        let l_der = cert_der(&engine, index.get("L").unwrap().artifacts().certificate.as_ref().unwrap());
        let (_, m_cert) = parse_x509_certificate(&m_der).unwrap();
        let (_, l_cert) = parse_x509_certificate(&l_der).unwrap();

        assert!(m_cert.is_ca());
        assert!(!l_cert.is_ca());
        assert_eq!(l_cert.issuer().to_string(), m_cert.subject().to_string());
        assert!(l_cert.verify_signature(Some(m_cert.public_key())).is_ok());
        let constraints = m_cert.basic_constraints().unwrap().unwrap().value;
        assert_eq!(constraints.path_len_constraint, Some(1));
    }

    #[test]
    fn test_revoke_lists_serial_in_issuer_crl() {
        let engine = RcgenEngine::default();
        let lifecycle = Lifecycle::new(&engine);
        let mut index = scenario_b();
        lifecycle
            .batch_generate(&mut index, &BatchOptions::default())
            .unwrap();

        let l_cert = index.get("L").unwrap().artifacts().certificate.clone().unwrap();
        let l_serial = engine.serial_of(&l_cert).unwrap();

        let report = lifecycle
            .revoke(&mut index, "M", RevocationReason::KeyCompromise, false)
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed_steps(Step::Revoke), ["L"]);
        assert_eq!(report.completed_steps(Step::RevocationList), ["M"]);

        let crl = index.get("M").unwrap().artifacts().revocation_list.clone().unwrap();
        let pem = engine.artifact_bytes(&crl).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem).unwrap();
        let (_, crl) = parse_x509_crl(&pem.contents).unwrap();
        let serials: Vec<u64> = crl
            .iter_revoked_certificates()
            .filter_map(|r| r.serial().to_u64_digits().first().copied())
            .collect();
        assert_eq!(serials, vec![l_serial]);

        let again = lifecycle
            .revoke(&mut index, "M", RevocationReason::KeyCompromise, false)
            .unwrap();
        assert!(again.failed("L"));
    }

    #[test]
    fn test_convert_keeps_original_handle() {
        let engine = RcgenEngine::new(EngineConfig::default());
        let lifecycle = Lifecycle::new(&engine);
        let mut index = scenario_b();
        lifecycle
            .batch_generate(&mut index, &BatchOptions::default())
            .unwrap();

        let der = lifecycle
            .convert_format(&index, "L", ArtifactKind::Certificate, ArtifactFormat::Der)
            .unwrap();
        assert_eq!(der.format, ArtifactFormat::Der);
        assert!(parse_x509_certificate(&engine.artifact_bytes(&der).unwrap()).is_ok());

        let original = index.get("L").unwrap().artifacts().certificate.as_ref().unwrap();
        assert_eq!(original.format, ArtifactFormat::Pem);
    }
}
