use std::io;
use thiserror::Error;

use crate::types::{NodeKind, Status, Step};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node id already present: {0}")]
    DuplicateId(String),

    #[error("Issuer {0} is not in the hierarchy, insert it first")]
    UnresolvedIssuer(String),

    #[error("Issuer {issuer} cannot sign: kind={kind:?} path_limit={path_limit}")]
    IneligibleIssuer {
        issuer: String,
        kind: NodeKind,
        path_limit: u32,
    },

    #[error("Hierarchy is corrupted: only {placed} of {total} nodes could be ordered")]
    Cycle { placed: usize, total: usize },

    #[error("Engine failed on node {node} during {step}: {source}")]
    Engine {
        node: String,
        step: Step,
        #[source]
        source: Box<Error>,
    },

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node {node} is in state {status:?}")]
    InvalidState { node: String, status: Status },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error("Key generation error: {0}")]
    KeyGen(String),

    #[error("Artifact not found: {0}")]
    MissingArtifact(String),

    #[error("Certificate already revoked: serial {0}")]
    AlreadyRevoked(String),

    #[error("PKCS12 export error: {0}")]
    Pkcs12(String),

    #[error("PEM parsing error: {0}")]
    Pem(String),

    #[error("X509 parsing error: {0}")]
    X509Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid snapshot: {0}")]
    Snapshot(String),
}

impl Error {
    /// Wraps an engine failure with the node and step it happened on.
    pub fn engine(node: impl Into<String>, step: Step, source: Error) -> Self {
        Error::Engine {
            node: node.into(),
            step,
            source: Box::new(source),
        }
    }

    /// Structural errors are surfaced by insert and never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::DuplicateId(_) | Error::UnresolvedIssuer(_) | Error::IneligibleIssuer { .. }
        )
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::CertGen(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::PEMError>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::PEMError>) -> Self {
        Error::Pem(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        Error::X509Parse(err.to_string())
    }
}

impl From<rsa::Error> for Error {
    fn from(err: rsa::Error) -> Self {
        Error::KeyGen(err.to_string())
    }
}

impl From<pkcs8::Error> for Error {
    fn from(err: pkcs8::Error) -> Self {
        Error::KeyGen(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
