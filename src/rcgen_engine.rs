//! In-memory [`CryptoEngine`] backed by rcgen.
//!
//! Artifacts live in a map keyed by their location; locations follow the
//! layout `<namespace>/<hierarchy>/<dir>/<node>.<kind>.<format>`. Nothing is
//! written to disk unless the caller asks for it with
//! [`RcgenEngine::save_artifact`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationList,
    CertificateRevocationListParams, CrlDistributionPoint, CustomExtension, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose, RevokedCertParams, SerialNumber, SignatureAlgorithm,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use crate::config::{BundleFormat, EngineConfig};
use crate::engine::{CryptoEngine, IssuerCredentials};
use crate::error::{Error, Result};
use crate::node::NodeRecord;
use crate::types::{
    Artifact, ArtifactFormat, ArtifactKind, KeySpec, NodeKind, RevocationReason,
};

const OID_AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const OID_ACCESS_METHOD_OCSP: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1];

#[derive(Debug, Clone)]
pub struct RevokedEntry {
    pub serial: u64,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
}

struct Signer {
    certificate: Certificate,
    alg: &'static SignatureAlgorithm,
    serial: u64,
}

#[derive(Default)]
struct Store {
    blobs: HashMap<String, Vec<u8>>,
    signers: HashMap<String, Signer>,
    revoked: HashMap<String, Vec<RevokedEntry>>,
    crl_numbers: HashMap<String, u64>,
}

pub struct RcgenEngine {
    config: EngineConfig,
    store: RwLock<Store>,
}

impl RcgenEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: RwLock::new(Store::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Encoded bytes of an artifact.
    pub fn artifact_bytes(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        self.store
            .read()
            .blobs
            .get(&artifact.location)
            .cloned()
            .ok_or_else(|| Error::MissingArtifact(artifact.location.clone()))
    }

    /// Bytes kept from the revocation list that `artifact` replaced.
    pub fn backup_bytes(&self, artifact: &Artifact) -> Option<Vec<u8>> {
        let backup = format!("{}{}", artifact.location, self.config.backup_suffix);
        self.store.read().blobs.get(&backup).cloned()
    }

    pub fn save_artifact(&self, artifact: &Artifact, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.artifact_bytes(artifact)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn serial_of(&self, certificate: &Artifact) -> Option<u64> {
        self.store
            .read()
            .signers
            .get(&certificate.location)
            .map(|s| s.serial)
    }

    /// Serials revoked under the issuer that owns `certificate`.
    pub fn revoked_serials(&self, certificate: &Artifact) -> Vec<u64> {
        self.store
            .read()
            .revoked
            .get(&certificate.location)
            .map(|entries| entries.iter().map(|e| e.serial).collect())
            .unwrap_or_default()
    }

    fn location(&self, node: &NodeRecord, kind: ArtifactKind, format: ArtifactFormat) -> String {
        let dir = match kind {
            ArtifactKind::Key => ".keys",
            ArtifactKind::Request => "csrs",
            ArtifactKind::Certificate | ArtifactKind::Bundle => "certs",
            ArtifactKind::RevocationList => "crls",
        };
        format!(
            "{}/{}/{}/{}.{}.{}",
            self.config.namespace,
            node.hierarchy_id().unwrap_or("detached"),
            dir,
            node.id(),
            kind.extension(),
            format.extension()
        )
    }

    fn put(&self, artifact: &Artifact, bytes: Vec<u8>) {
        debug!(location = %artifact.location, size = bytes.len(), "Artifact stored");
        self.store
            .write()
            .blobs
            .insert(artifact.location.clone(), bytes);
    }

    fn der_of(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let bytes = self.artifact_bytes(artifact)?;
        match artifact.format {
            ArtifactFormat::Der => Ok(bytes),
            ArtifactFormat::Pem => {
                let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes)?;
                Ok(pem.contents)
            }
            ArtifactFormat::Pkcs12 => Err(Error::InvalidInput(format!(
                "{} is a PKCS#12 archive",
                artifact.location
            ))),
        }
    }

    fn load_key(&self, key: &Artifact, alg: &'static SignatureAlgorithm) -> Result<KeyPair> {
        let der = self.der_of(key)?;
        Ok(KeyPair::from_der_and_sign_algo(&der, alg)?)
    }

    fn node_key(&self, node: &NodeRecord, alg: &'static SignatureAlgorithm) -> Result<KeyPair> {
        let key = node
            .artifacts()
            .key
            .as_ref()
            .ok_or_else(|| Error::MissingArtifact(format!("key of {}", node.id())))?;
        self.load_key(key, alg)
    }

    /// Subject and alternative names only. rcgen refuses every other
    /// extension in a signing request.
    fn request_params(
        &self,
        node: &NodeRecord,
        alg: &'static SignatureAlgorithm,
    ) -> CertificateParams {
        let policy = node.policy();
        let mut params = CertificateParams::default();
        params.alg = alg;
        params.distinguished_name = policy.subject.to_rcgen();
        params.subject_alt_names = policy.san.to_rcgen();
        params
    }

    fn params_for(&self, node: &NodeRecord, alg: &'static SignatureAlgorithm) -> CertificateParams {
        let policy = node.policy();
        let mut params = self.request_params(node, alg);

        match node.kind() {
            NodeKind::Authority => {
                let path_len = u8::try_from(node.path_limit()).unwrap_or(u8::MAX);
                params.is_ca = IsCa::Ca(BasicConstraints::Constrained(path_len));
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                ];
            }
            NodeKind::EndEntity => {
                params.is_ca = IsCa::ExplicitNoCa;
                params.key_usages = vec![
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::ContentCommitment,
                    KeyUsagePurpose::KeyEncipherment,
                ];
            }
        }

        if !policy.crl_distribution_points.is_empty() {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: policy.crl_distribution_points.clone(),
            }];
        }
        if !policy.ocsp_responders.is_empty() {
            params
                .custom_extensions
                .push(ocsp_extension(&policy.ocsp_responders));
        }
        params.use_authority_key_identifier_extension = !node.is_root();
        params.key_identifier_method = KeyIdMethod::Sha256;
        params
    }

    /// The stored request must carry a valid self-signature over the key
    /// the certificate is about to bind.
    fn check_request(&self, node: &NodeRecord, key_pair: &KeyPair) -> Result<()> {
        let request = node
            .artifacts()
            .request
            .as_ref()
            .ok_or_else(|| Error::MissingArtifact(format!("request of {}", node.id())))?;
        let der = self.der_of(request)?;
        let (_, csr) = X509CertificationRequest::from_der(&der)?;
        csr.verify_signature()
            .map_err(|e| Error::X509Parse(format!("request of {}: {}", node.id(), e)))?;

        let requested = &csr.certification_request_info.subject_pki.subject_public_key;
        if requested.data.as_ref() != key_pair.public_key_raw() {
            return Err(Error::InvalidInput(format!(
                "request of {} does not match its key",
                node.id()
            )));
        }
        Ok(())
    }
}

impl Default for RcgenEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn ocsp_extension(responders: &[String]) -> CustomExtension {
    let content = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            for uri in responders {
                writer.next().write_sequence(|writer| {
                    writer
                        .next()
                        .write_oid(&yasna::models::ObjectIdentifier::from_slice(
                            OID_ACCESS_METHOD_OCSP,
                        ));
                    writer
                        .next()
                        .write_tagged_implicit(yasna::Tag::context(6), |writer| {
                            writer.write_ia5_string(uri)
                        });
                });
            }
        });
    });
    CustomExtension::from_oid_content(OID_AUTHORITY_INFO_ACCESS, content)
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CertGen(format!("Invalid timestamp: {}", e)))
}

fn validity(days: u32) -> Result<(time::OffsetDateTime, time::OffsetDateTime)> {
    let not_before = Utc::now();
    let not_after = not_before + chrono::Duration::days(i64::from(days));
    Ok((to_offset(not_before)?, to_offset(not_after)?))
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_config(&pem::Pem::new(label, der), config)
}

fn with_format(location: &str, format: ArtifactFormat) -> String {
    let stem = location
        .strip_suffix(".pem")
        .or_else(|| location.strip_suffix(".der"))
        .unwrap_or(location);
    format!("{}.{}", stem, format.extension())
}

impl CryptoEngine for RcgenEngine {
    fn generate_key(&self, node: &NodeRecord) -> Result<Artifact> {
        let policy = node.policy();
        let pem = match policy.key {
            KeySpec::Rsa(bits) => {
                let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits as usize)?;
                key.to_pkcs8_pem(LineEnding::LF)?.as_str().to_owned()
            }
            spec => KeyPair::generate(spec.to_rcgen(policy.certificate_digest))?.serialize_pem(),
        };

        let artifact = Artifact::new(
            ArtifactKind::Key,
            ArtifactFormat::Pem,
            self.location(node, ArtifactKind::Key, ArtifactFormat::Pem),
        );
        self.put(&artifact, pem.into_bytes());
        Ok(artifact)
    }

    fn generate_request(&self, node: &NodeRecord) -> Result<Artifact> {
        let policy = node.policy();
        let alg = policy.key.to_rcgen(policy.request_digest);
        let mut params = self.request_params(node, alg);
        params.key_pair = Some(self.node_key(node, alg)?);

        let pem = Certificate::from_params(params)?.serialize_request_pem()?;
        let artifact = Artifact::new(
            ArtifactKind::Request,
            ArtifactFormat::Pem,
            self.location(node, ArtifactKind::Request, ArtifactFormat::Pem),
        );
        self.put(&artifact, pem.into_bytes());
        Ok(artifact)
    }

    fn generate_certificate(
        &self,
        node: &NodeRecord,
        issuer: IssuerCredentials<'_>,
        serial: u64,
    ) -> Result<Artifact> {
        let policy = node.policy();
        let alg = policy.key.to_rcgen(policy.certificate_digest);
        let mut params = self.params_for(node, alg);
        let (not_before, not_after) = validity(policy.life)?;
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from(serial));
        let key_pair = match issuer.certificate {
            None => self.load_key(issuer.key, alg)?,
            Some(_) => self.node_key(node, alg)?,
        };
        self.check_request(node, &key_pair)?;
        params.key_pair = Some(key_pair);

        let certificate = Certificate::from_params(params)?;
        let pem = match issuer.certificate {
            None => certificate.serialize_pem()?,
            Some(issuer_cert) => {
                let store = self.store.read();
                let signer = store
                    .signers
                    .get(&issuer_cert.location)
                    .ok_or_else(|| Error::MissingArtifact(issuer_cert.location.clone()))?;
                certificate.serialize_pem_with_signer(&signer.certificate)?
            }
        };

        let artifact = Artifact::new(
            ArtifactKind::Certificate,
            ArtifactFormat::Pem,
            self.location(node, ArtifactKind::Certificate, ArtifactFormat::Pem),
        );
        let mut store = self.store.write();
        store.blobs.insert(artifact.location.clone(), pem.into_bytes());
        // A new certificate starts with an empty revocation record.
        store.revoked.remove(&artifact.location);
        store.signers.insert(
            artifact.location.clone(),
            Signer {
                certificate,
                alg,
                serial,
            },
        );
        debug!(node = %node.id(), serial, "Certificate issued");
        Ok(artifact)
    }

    fn generate_revocation_list(
        &self,
        node: &NodeRecord,
        existing: Option<&Artifact>,
    ) -> Result<Artifact> {
        let cert = node
            .artifacts()
            .certificate
            .as_ref()
            .ok_or_else(|| Error::MissingArtifact(format!("certificate of {}", node.id())))?;
        let (this_update, next_update) = validity(node.policy().crl_life)?;

        let mut store = self.store.write();
        let crl_number = {
            let n = store.crl_numbers.entry(cert.location.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let revoked_certs = store
            .revoked
            .get(&cert.location)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| {
                        Ok(RevokedCertParams {
                            serial_number: SerialNumber::from(e.serial),
                            revocation_time: to_offset(e.revoked_at)?,
                            reason_code: Some(e.reason.to_rcgen()),
                            invalidity_date: None,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let signer = store
            .signers
            .get(&cert.location)
            .ok_or_else(|| Error::MissingArtifact(cert.location.clone()))?;
        let params = CertificateRevocationListParams {
            this_update,
            next_update,
            crl_number: SerialNumber::from(crl_number),
            issuing_distribution_point: None,
            revoked_certs,
            alg: signer.alg,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let pem = CertificateRevocationList::from_params(params)?
            .serialize_pem_with_signer(&signer.certificate)?;

        if let Some(previous) = existing {
            if let Some(bytes) = store.blobs.get(&previous.location).cloned() {
                let backup = format!("{}{}", previous.location, self.config.backup_suffix);
                store.blobs.insert(backup, bytes);
            }
        }

        let artifact = Artifact::new(
            ArtifactKind::RevocationList,
            ArtifactFormat::Pem,
            self.location(node, ArtifactKind::RevocationList, ArtifactFormat::Pem),
        );
        store.blobs.insert(artifact.location.clone(), pem.into_bytes());
        Ok(artifact)
    }

    fn revoke(
        &self,
        certificate: &Artifact,
        issuer: IssuerCredentials<'_>,
        reason: RevocationReason,
    ) -> Result<()> {
        let issuer_cert = issuer.certificate.unwrap_or(certificate);
        let mut store = self.store.write();
        let serial = store
            .signers
            .get(&certificate.location)
            .map(|s| s.serial)
            .ok_or_else(|| Error::MissingArtifact(certificate.location.clone()))?;
        if !store.signers.contains_key(&issuer_cert.location) {
            return Err(Error::MissingArtifact(issuer_cert.location.clone()));
        }

        let entries = store.revoked.entry(issuer_cert.location.clone()).or_default();
        if entries.iter().any(|e| e.serial == serial) {
            return Err(Error::AlreadyRevoked(format!("{:x}", serial)));
        }
        entries.push(RevokedEntry {
            serial,
            reason,
            revoked_at: Utc::now(),
        });
        debug!(serial, issuer = %issuer_cert.location, reason = %reason, "Certificate revoked");
        Ok(())
    }

    fn generate_bundle(&self, node: &NodeRecord, chain: &[Artifact]) -> Result<Artifact> {
        let (format, bytes) = match self.config.bundle_format {
            BundleFormat::Pkcs12 => {
                let key = node
                    .artifacts()
                    .key
                    .as_ref()
                    .ok_or_else(|| Error::MissingArtifact(format!("key of {}", node.id())))?;
                let (leaf, issuers) = chain
                    .split_first()
                    .ok_or_else(|| Error::InvalidInput("empty trust chain".to_string()))?;

                let key_der = self.der_of(key)?;
                let cert_der = self.der_of(leaf)?;
                let ca_ders = issuers
                    .iter()
                    .filter(|c| c.location != leaf.location)
                    .map(|c| self.der_of(c))
                    .collect::<Result<Vec<_>>>()?;
                let ca_refs: Vec<&[u8]> = ca_ders.iter().map(Vec::as_slice).collect();

                let pfx = p12::PFX::new_with_cas(
                    &cert_der,
                    &key_der,
                    &ca_refs,
                    &self.config.bundle_password,
                    node.id(),
                )
                .ok_or_else(|| Error::Pkcs12(format!("could not build archive for {}", node.id())))?;
                (ArtifactFormat::Pkcs12, pfx.to_der())
            }
            BundleFormat::PemChain => {
                let mut full_chain = Vec::new();
                for cert in chain {
                    let der = self.der_of(cert)?;
                    full_chain.extend(pem_encode(ArtifactKind::Certificate.pem_label(), &der).into_bytes());
                }
                (ArtifactFormat::Pem, full_chain)
            }
        };

        let artifact = Artifact::new(
            ArtifactKind::Bundle,
            format,
            self.location(node, ArtifactKind::Bundle, format),
        );
        self.put(&artifact, bytes);
        Ok(artifact)
    }

    fn convert_format(&self, artifact: &Artifact, target: ArtifactFormat) -> Result<Artifact> {
        if artifact.format == target {
            return Ok(artifact.clone());
        }
        if artifact.kind == ArtifactKind::Bundle || target == ArtifactFormat::Pkcs12 {
            return Err(Error::InvalidInput(format!(
                "cannot convert {} to {:?}",
                artifact.location, target
            )));
        }

        let der = self.der_of(artifact)?;
        let bytes = match target {
            ArtifactFormat::Der => der,
            _ => pem_encode(artifact.kind.pem_label(), &der).into_bytes(),
        };
        let converted = Artifact::new(artifact.kind, target, with_format(&artifact.location, target));
        self.put(&converted, bytes);
        Ok(converted)
    }
}
