//! Cross-cutting arguments shared by every subcommand.

use crate::backup::scheduler::FailurePolicy;
use crate::backup::stage::JobCrypto;
use crate::compress::{self, Compressor};
use crate::manifest::DEFAULT_SEPARATOR;
use crate::pgp::Keyring;
use crate::restore::RestoreCrypto;
use crate::retry::RetryPolicy;
use anyhow::{Result, bail};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_VOLUME_SIZE: u64 = 200 * 1024 * 1024;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub separator: char,
    pub working_directory: PathBuf,
    /// Bytes per volume.
    pub volume_size: u64,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// Per-request backend timeout.
    pub timeout: Duration,
    pub compressor: Compressor,
    pub compression_level: i32,
    pub failure_policy: FailurePolicy,
    pub quiet: bool,
    pub public_keyring: Option<PathBuf>,
    pub secret_keyring: Option<PathBuf>,
    pub encrypt_to: Option<String>,
    pub sign_from: Option<String>,
}

impl Default for GlobalArgs {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR,
            working_directory: std::env::temp_dir(),
            volume_size: DEFAULT_VOLUME_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
            compressor: Compressor::Zstd,
            compression_level: compress::DEFAULT_LEVEL,
            failure_policy: FailurePolicy::FailFast,
            quiet: false,
            public_keyring: None,
            secret_keyring: None,
            encrypt_to: None,
            sign_from: None,
        }
    }
}

impl GlobalArgs {
    /// Resolve the OpenPGP keys a backup needs, before any side effect.
    ///
    /// # Errors
    /// `--encryptTo` without a public keyring, `--signFrom` without a secret
    /// keyring, or a user with no key in the ring.
    pub fn seal_crypto(&self) -> Result<Option<JobCrypto>> {
        if self.encrypt_to.is_none() && self.sign_from.is_none() {
            return Ok(None);
        }

        let recipients = match &self.encrypt_to {
            Some(user) => {
                let Some(path) = &self.public_keyring else {
                    bail!("--encryptTo needs --publicKeyRingPath");
                };
                vec![Keyring::load(path)?.find(user)?.clone()]
            }
            None => Vec::new(),
        };

        let signer = match &self.sign_from {
            Some(user) => {
                let Some(path) = &self.secret_keyring else {
                    bail!("--signFrom needs --secretKeyRingPath");
                };
                Some(Keyring::load(path)?.find(user)?.clone())
            }
            None => None,
        };

        Ok(Some(JobCrypto { recipients, signer }))
    }

    /// Resolve the OpenPGP keys a restore needs.
    ///
    /// # Errors
    /// `--signFrom` without a public keyring, or a user with no key.
    pub fn open_crypto(&self) -> Result<Option<RestoreCrypto>> {
        if self.secret_keyring.is_none() && self.sign_from.is_none() {
            return Ok(None);
        }

        let secrets = match &self.secret_keyring {
            Some(path) => Keyring::load(path)?.certs().to_vec(),
            None => Vec::new(),
        };

        let verifiers = match &self.sign_from {
            Some(user) => {
                let Some(path) = &self.public_keyring else {
                    bail!("--signFrom needs --publicKeyRingPath to verify against");
                };
                vec![Keyring::load(path)?.find(user)?.clone()]
            }
            None => Vec::new(),
        };

        Ok(Some(RestoreCrypto {
            secrets,
            verifiers,
            require_signature: self.sign_from.is_some(),
        }))
    }
}
