use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Authority,
    EndEntity,
}

impl std::str::FromStr for NodeKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ca" | "authority" => Ok(NodeKind::Authority),
            "u" | "user" | "end-entity" | "endentity" => Ok(NodeKind::EndEntity),
            _ => Err(crate::Error::InvalidInput(format!("Unknown node kind: {}", s))),
        }
    }
}

/// Generation state of a node. Variants are declared in lifecycle order so
/// `Ord` compares progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    AwaitingKey,
    AwaitingRequest,
    AwaitingCertificate,
    AwaitingRevocationList,
    Complete,
}

/// One artifact-producing operation of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Key,
    Request,
    Certificate,
    RevocationList,
    Revoke,
    Bundle,
    Convert,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Key => "key",
            Step::Request => "request",
            Step::Certificate => "certificate",
            Step::RevocationList => "revocation-list",
            Step::Revoke => "revoke",
            Step::Bundle => "bundle",
            Step::Convert => "convert",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySpec {
    Rsa(u32),
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl KeySpec {
    pub const RSA_SIZES: [u32; 3] = [2048, 3072, 4096];

    pub fn is_supported(&self) -> bool {
        match self {
            KeySpec::Rsa(bits) => Self::RSA_SIZES.contains(bits),
            _ => true,
        }
    }

    /// Signature algorithm used when this key signs, given the requested digest.
    /// Curves carry their own digest; only RSA honours the choice.
    pub fn to_rcgen(&self, digest: Digest) -> &'static rcgen::SignatureAlgorithm {
        match self {
            KeySpec::Ed25519 => &rcgen::PKCS_ED25519,
            KeySpec::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeySpec::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeySpec::Rsa(_) => match digest {
                Digest::Sha256 => &rcgen::PKCS_RSA_SHA256,
                Digest::Sha384 => &rcgen::PKCS_RSA_SHA384,
                Digest::Sha512 => &rcgen::PKCS_RSA_SHA512,
            },
        }
    }

    pub fn name(&self) -> String {
        match self {
            KeySpec::Rsa(bits) => format!("RSA {}", bits),
            KeySpec::EcdsaP256 => "ECDSA P-256".to_string(),
            KeySpec::EcdsaP384 => "ECDSA P-384".to_string(),
            KeySpec::Ed25519 => "Ed25519".to_string(),
        }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Rsa(2048)
    }
}

impl std::str::FromStr for KeySpec {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ed25519" => Ok(KeySpec::Ed25519),
            "ecdsa-p256" | "ecdsap256" | "p256" | "prime256v1" => Ok(KeySpec::EcdsaP256),
            "ecdsa-p384" | "ecdsap384" | "p384" | "secp384r1" => Ok(KeySpec::EcdsaP384),
            "rsa2048" | "rsa-2048" | "rsa" => Ok(KeySpec::Rsa(2048)),
            "rsa3072" | "rsa-3072" => Ok(KeySpec::Rsa(3072)),
            "rsa4096" | "rsa-4096" => Ok(KeySpec::Rsa(4096)),
            _ => Err(crate::Error::InvalidInput(format!(
                "Unsupported key algorithm: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Digest {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl std::str::FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(Digest::Sha256),
            "sha384" => Ok(Digest::Sha384),
            "sha512" => Ok(Digest::Sha512),
            _ => Err(crate::Error::InvalidInput(format!("Unknown digest: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub email: Option<String>,
}

impl DistinguishedName {
    pub fn new(cn: impl Into<String>) -> Self {
        Self {
            common_name: cn.into(),
            organization: None,
            organizational_unit: None,
            country: None,
            state: None,
            locality: None,
            email: None,
        }
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn with_organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = Some(ou.into());
        self
    }

    /// Only the first two characters are kept.
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        let country: String = country.into();
        self.country = Some(country.chars().take(2).collect());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn to_rcgen(&self) -> rcgen::DistinguishedName {
        let mut dn = rcgen::DistinguishedName::new();

        if let Some(ref country) = self.country {
            dn.push(rcgen::DnType::CountryName, country.as_str());
        }
        if let Some(ref state) = self.state {
            dn.push(rcgen::DnType::StateOrProvinceName, state.as_str());
        }
        if let Some(ref locality) = self.locality {
            dn.push(rcgen::DnType::LocalityName, locality.as_str());
        }
        if let Some(ref org) = self.organization {
            dn.push(rcgen::DnType::OrganizationName, org.as_str());
        }
        if let Some(ref ou) = self.organizational_unit {
            dn.push(rcgen::DnType::OrganizationalUnitName, ou.as_str());
        }
        dn.push(rcgen::DnType::CommonName, self.common_name.as_str());

        dn
    }
}

impl Default for DistinguishedName {
    fn default() -> Self {
        DistinguishedName::new("certree.local")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAltName {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub email_addresses: Vec<String>,
    pub uris: Vec<String>,
}

impl SubjectAltName {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma separated list such as `"ip=10.0.0.1, dns=example.com"`.
    /// Entries with an unknown prefix or an unparsable address are skipped.
    pub fn parse(list: &str) -> Self {
        let mut san = SubjectAltName::new();
        let compact = list.to_lowercase().replace(' ', "");

        for entry in compact.split(',').filter(|e| !e.is_empty()) {
            let value = entry.rsplit('=').next().unwrap_or_default().to_string();
            if entry.starts_with("ip") {
                match value.parse() {
                    Ok(ip) => san.ip_addresses.push(ip),
                    Err(_) => warn!(entry = %entry, "Skipping unparsable IP subject alternative name"),
                }
            } else if entry.starts_with("dns") {
                san.dns_names.push(value);
            } else if entry.starts_with("email") {
                san.email_addresses.push(value);
            } else if entry.starts_with("uri") {
                san.uris.push(value);
            } else {
                warn!(entry = %entry, "Skipping subject alternative name argument");
            }
        }

        san
    }

    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.dns_names.push(dns.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email_addresses.push(email.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty()
            && self.ip_addresses.is_empty()
            && self.email_addresses.is_empty()
            && self.uris.is_empty()
    }

    pub fn to_rcgen(&self) -> Vec<rcgen::SanType> {
        let mut san_vec = Vec::new();
        for dns in &self.dns_names {
            san_vec.push(rcgen::SanType::DnsName(dns.clone()));
        }
        for ip in &self.ip_addresses {
            san_vec.push(rcgen::SanType::IpAddress(*ip));
        }
        for email in &self.email_addresses {
            san_vec.push(rcgen::SanType::Rfc822Name(email.clone()));
        }
        for uri in &self.uris {
            san_vec.push(rcgen::SanType::URI(uri.clone()));
        }
        san_vec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    CACompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCRL,
}

impl RevocationReason {
    pub const ALL: [RevocationReason; 8] = [
        RevocationReason::Unspecified,
        RevocationReason::KeyCompromise,
        RevocationReason::CACompromise,
        RevocationReason::AffiliationChanged,
        RevocationReason::Superseded,
        RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold,
        RevocationReason::RemoveFromCRL,
    ];

    /// Reads a reason from the revocation vocabulary, falling back to
    /// `Unspecified` when the name is absent or unknown.
    pub fn from_name(name: Option<&str>) -> Self {
        name.and_then(|n| n.parse().ok()).unwrap_or_default()
    }

    pub fn name(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CACompromise => "CACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
            RevocationReason::RemoveFromCRL => "removeFromCRL",
        }
    }

    pub fn to_code(&self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CACompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCRL => 8,
        }
    }

    pub fn to_rcgen(&self) -> rcgen::RevocationReason {
        match self {
            RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
            RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
            RevocationReason::CACompromise => rcgen::RevocationReason::CaCompromise,
            RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
            RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
            RevocationReason::CessationOfOperation => {
                rcgen::RevocationReason::CessationOfOperation
            }
            RevocationReason::CertificateHold => rcgen::RevocationReason::CertificateHold,
            RevocationReason::RemoveFromCRL => rcgen::RevocationReason::RemoveFromCrl,
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.to_lowercase().replace(['-', '_', ' '], "");
        RevocationReason::ALL
            .into_iter()
            .find(|r| r.name().to_lowercase() == key)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Invalid revocation reason: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Key,
    Request,
    Certificate,
    RevocationList,
    Bundle,
}

impl ArtifactKind {
    pub fn pem_label(&self) -> &'static str {
        match self {
            ArtifactKind::Key => "PRIVATE KEY",
            ArtifactKind::Request => "CERTIFICATE REQUEST",
            ArtifactKind::Certificate | ArtifactKind::Bundle => "CERTIFICATE",
            ArtifactKind::RevocationList => "X509 CRL",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Key => "key",
            ArtifactKind::Request => "csr",
            ArtifactKind::Certificate => "cert",
            ArtifactKind::RevocationList => "crl",
            ArtifactKind::Bundle => "bundle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Pem,
    Der,
    Pkcs12,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Pem => "pem",
            ArtifactFormat::Der => "der",
            ArtifactFormat::Pkcs12 => "p12",
        }
    }
}

/// Opaque handle to something the engine produced. The kind is fixed when the
/// engine creates it, never inferred from the location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub format: ArtifactFormat,
    pub location: String,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, format: ArtifactFormat, location: impl Into<String>) -> Self {
        Self {
            kind,
            format,
            location: location.into(),
        }
    }
}
