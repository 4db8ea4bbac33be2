//! # TLS Identity
//!
//! WebTransport needs TLS. Browsers accept a self-signed certificate when the
//! page passes its SHA-256 hash in `serverCertificateHashes`, which the
//! server publishes at `/cert-hash`. Such certificates must be short-lived;
//! the generated ones are valid for 14 days.

use anyhow::Context;
use std::path::Path;
use wtransport::Identity;
use wtransport::tls::Sha256Digest;

/// A certificate chain, its private key and the hash of the leaf.
pub struct CertInfo {
    identity: Identity,
    hash: [u8; 32],
}

impl CertInfo {
    /// Generates a self-signed certificate for `host` plus the loopback names.
    pub fn self_signed(host: &str) -> anyhow::Result<Self> {
        let mut names = vec![host.to_string()];
        for name in ["localhost", "127.0.0.1", "::1"] {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        let identity =
            Identity::self_signed(&names).context("failed to generate self-signed certificate")?;
        Self::from_identity(identity)
    }

    /// Loads a PEM certificate chain and private key.
    pub async fn from_pem_files(cert: &Path, key: &Path) -> anyhow::Result<Self> {
        let identity = Identity::load_pemfiles(cert, key).await.with_context(|| {
            format!(
                "failed to load certificate {} with key {}",
                cert.display(),
                key.display()
            )
        })?;
        Self::from_identity(identity)
    }

    pub fn from_identity(identity: Identity) -> anyhow::Result<Self> {
        let leaf = identity
            .certificate_chain()
            .as_slice()
            .first()
            .context("certificate chain is empty")?;
        let digest: Sha256Digest = leaf.hash();
        let hash = *AsRef::<[u8; 32]>::as_ref(&digest);
        Ok(Self { identity, hash })
    }

    /// SHA-256 of the leaf certificate (DER).
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn identity(&self) -> Identity {
        self.identity.clone_identity()
    }
}

impl Clone for CertInfo {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone_identity(),
            hash: self.hash,
        }
    }
}

impl std::fmt::Debug for CertInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertInfo")
            .field("sha256", &self.hash_hex())
            .finish_non_exhaustive()
    }
}
