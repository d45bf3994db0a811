//! Where managed-wallet secrets live.
//!
//! The status store only ever sees addresses. Signing keys are created and unlocked through a
//! [`CredentialProvider`]; the production provider writes one encrypted JSON keystore
//! (Web3 Secret Storage) per wallet.

use alloy::primitives::Address;
use alloy::signers::local::{LocalSignerError, PrivateKeySigner};
use dashmap::DashMap;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keystore error: {0}")]
    Keystore(#[from] LocalSignerError),
    #[error("no credentials for wallet {0}")]
    NotFound(Address),
}

pub trait CredentialProvider: Send + Sync {
    /// Creates a new keypair, stores its secret and returns the address.
    fn create(&self) -> Result<Address, CredentialError>;

    /// Unlocks the signer for `address`.
    fn signer(&self, address: Address) -> Result<PrivateKeySigner, CredentialError>;

    /// Addresses this provider holds secrets for.
    fn addresses(&self) -> Result<Vec<Address>, CredentialError>;
}

/// Encrypted keystore files in a directory, named `<address>.json`.
pub struct KeystoreCredentials {
    dir: PathBuf,
    password: String,
    /// Decryption is deliberately slow (scrypt), so unlocked signers are kept for the run.
    unlocked: DashMap<Address, PrivateKeySigner>,
}

impl KeystoreCredentials {
    pub fn new(dir: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            password: password.into(),
            unlocked: DashMap::new(),
        }
    }

    fn file_name(address: Address) -> String {
        format!("{address}.json")
    }
}

impl CredentialProvider for KeystoreCredentials {
    fn create(&self) -> Result<Address, CredentialError> {
        std::fs::create_dir_all(&self.dir)?;
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        let name = Self::file_name(address);
        PrivateKeySigner::encrypt_keystore(
            &self.dir,
            &mut rand::thread_rng(),
            signer.to_bytes(),
            &self.password,
            Some(&name),
        )?;
        tracing::debug!(%address, file = %name, "wrote encrypted keystore");
        self.unlocked.insert(address, signer);
        Ok(address)
    }

    fn signer(&self, address: Address) -> Result<PrivateKeySigner, CredentialError> {
        if let Some(signer) = self.unlocked.get(&address) {
            return Ok(signer.clone());
        }
        let path = self.dir.join(Self::file_name(address));
        if !path.exists() {
            return Err(CredentialError::NotFound(address));
        }
        let signer = PrivateKeySigner::decrypt_keystore(&path, &self.password)?;
        if signer.address() != address {
            tracing::error!(%address, decrypted = %signer.address(), "keystore file holds a different key");
            return Err(CredentialError::NotFound(address));
        }
        self.unlocked.insert(address, signer.clone());
        Ok(signer)
    }

    fn addresses(&self) -> Result<Vec<Address>, CredentialError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut addresses = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .extension()
                .filter(|ext| *ext == "json")
                .and(path.file_stem())
                .and_then(|stem| stem.to_str())
            else {
                continue;
            };
            match stem.parse::<Address>() {
                Ok(address) => addresses.push(address),
                Err(_) => tracing::debug!(file = %path.display(), "ignoring non-wallet keystore file"),
            }
        }
        addresses.sort();
        Ok(addresses)
    }
}

/// Unencrypted in-memory keys. Test builds only.
#[cfg(test)]
#[derive(Default)]
pub struct PlaintextCredentials {
    keys: DashMap<Address, PrivateKeySigner>,
}

#[cfg(test)]
impl PlaintextCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl CredentialProvider for PlaintextCredentials {
    fn create(&self) -> Result<Address, CredentialError> {
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        self.keys.insert(address, signer);
        Ok(address)
    }

    fn signer(&self, address: Address) -> Result<PrivateKeySigner, CredentialError> {
        self.keys
            .get(&address)
            .map(|s| s.clone())
            .ok_or(CredentialError::NotFound(address))
    }

    fn addresses(&self) -> Result<Vec<Address>, CredentialError> {
        let mut addresses: Vec<Address> = self.keys.iter().map(|e| *e.key()).collect();
        addresses.sort();
        Ok(addresses)
    }
}
