//! certree - certificate-authority hierarchy manager
//!
//! This library models an internal PKI as an issuance tree and drives every
//! node of it through key, request, certificate and revocation-list
//! generation:
//!
//! - Building the tree with issuer and path-length checks on insert
//! - Issuer-first ordering, subtrees and trust chains
//! - Batch generation with an optional worker pool and cancellation
//! - Branch revocation, renewal and revocation-list renewal
//! - Snapshot and restore of the whole hierarchy as JSON
//!
//! The cryptography itself sits behind [`CryptoEngine`]; [`RcgenEngine`] is
//! the in-memory implementation shipped with the crate.
//!
//! # Examples
//!
//! ## Building a hierarchy
//!
//! ```no_run
//! use certree::{HierarchyIndex, NodeRecord};
//!
//! let mut index = HierarchyIndex::new();
//! index.insert(NodeRecord::authority("root").with_path_limit(1)).unwrap();
//! index.insert(NodeRecord::end_entity("web").issued_by("root")).unwrap();
//!
//! assert_eq!(index.trust_chain("web"), ["web", "root"]);
//! ```
//!
//! ## Generating everything
//!
//! ```no_run
//! use certree::{BatchOptions, HierarchyIndex, KeySpec, Lifecycle, NodeRecord, RcgenEngine};
//!
//! let mut index = HierarchyIndex::new();
//! index
//!     .insert(NodeRecord::authority("root").with_path_limit(1).with_key(KeySpec::EcdsaP256))
//!     .unwrap();
//! index
//!     .insert(NodeRecord::end_entity("web").issued_by("root").with_key(KeySpec::EcdsaP256))
//!     .unwrap();
//!
//! let engine = RcgenEngine::default();
//! let report = Lifecycle::new(&engine)
//!     .batch_generate(&mut index, &BatchOptions::default().with_bundles(true))
//!     .unwrap();
//! assert!(report.is_success());
//!
//! let cert = index.get("web").unwrap().artifacts().certificate.clone().unwrap();
//! engine.save_artifact(&cert, "web.pem").unwrap();
//! ```

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod lifecycle;
pub mod node;
pub mod ordering;
pub mod rcgen_engine;
pub mod types;

pub use error::{Error, Result};

pub use batch::{BatchReport, Failure};
pub use config::{BatchOptions, BundleFormat, CancelToken, EngineConfig};
pub use engine::{CryptoEngine, IssuerCredentials};
pub use hierarchy::HierarchyIndex;
pub use lifecycle::Lifecycle;
pub use node::{Artifacts, NodeRecord, Policy};
pub use rcgen_engine::RcgenEngine;
pub use types::{
    Artifact, ArtifactFormat, ArtifactKind, Digest, DistinguishedName, KeySpec, NodeKind,
    RevocationReason, Status, Step, SubjectAltName,
};
