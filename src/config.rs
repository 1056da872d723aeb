use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleFormat {
    /// Key, certificate and issuer chain in one PKCS#12 archive.
    #[default]
    Pkcs12,
    /// The trust chain certificates concatenated as PEM.
    PemChain,
}

/// Settings of the rcgen-backed engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every artifact location.
    pub namespace: String,
    pub bundle_format: BundleFormat,
    pub bundle_password: String,
    /// Appended to a revocation list location to keep the previous one.
    pub backup_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "instances".to_string(),
            bundle_format: BundleFormat::default(),
            bundle_password: String::new(),
            backup_suffix: ".old".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

/// Stops a batch from dispatching further nodes. Calls already handed to the
/// engine run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Threads used for independent engine calls; 1 runs everything inline.
    pub workers: usize,
    /// Also produce a bundle for every node that finished.
    pub bundles: bool,
    pub cancel: CancelToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            bundles: false,
            cancel: CancelToken::new(),
        }
    }
}

impl BatchOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_bundles(mut self, bundles: bool) -> Self {
        self.bundles = bundles;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}
