//! Signing identities and domain-separated report signatures.
//!
//! A persistent identity derives its Ed25519 key from a seed file stored
//! next to the case data (created `0600`, reused across runs). When no seed
//! path is configured, an ephemeral identity is generated for the run and
//! marked as such, so report consumers can tell a durable signing identity
//! from a throwaway one.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroize;

pub const DOMAIN_REPORT: &str = "custody:report:v1";

const SEED_PREFIX: &str = "custodykey:";

/// Load a signing seed from disk or create one.
///
/// The seed is stored locally and reused across restarts. Creation is
/// race-safe: a concurrent creator wins and its seed is read back.
pub fn load_or_create_seed(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    if let Some(seed) = read_seed_file(path)? {
        return Ok(seed);
    }

    let mut seed_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed_bytes);
    let seed = format!("{SEED_PREFIX}{}", hex::encode(seed_bytes));
    seed_bytes.zeroize();

    if write_seed_file(path, &seed)? {
        return Ok(seed);
    }
    read_seed_file(path)?
        .ok_or_else(|| anyhow!("signing seed {} vanished during creation", path.display()))
}

fn read_seed_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read signing seed {}: {}", path.display(), e))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("signing seed file {} is empty", path.display()));
    }
    Ok(Some(trimmed.to_string()))
}

fn write_seed_file(path: &Path, seed: &str) -> Result<bool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow!(
                    "failed to create signing seed directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => {
            return Err(anyhow!(
                "failed to create signing seed {}: {}",
                path.display(),
                err
            ))
        }
    };

    file.write_all(seed.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| anyhow!("failed to write signing seed {}: {}", path.display(), e))?;
    Ok(true)
}

pub fn signing_key_from_seed(seed: &str) -> Result<SigningKey> {
    let trimmed = seed.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("signing seed is empty"));
    }
    let mut hasher = Sha256::new();
    hasher.update(trimmed.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(SigningKey::from_bytes(&digest))
}

/// The identity a report is signed under.
#[derive(Debug)]
pub struct SigningIdentity {
    key: SigningKey,
    subject: String,
    ephemeral: bool,
}

impl SigningIdentity {
    /// Durable identity backed by a seed file.
    pub fn persistent(seed_path: impl AsRef<Path>, subject: &str) -> Result<Self> {
        let seed = load_or_create_seed(seed_path)?;
        Ok(Self {
            key: signing_key_from_seed(&seed)?,
            subject: subject.to_string(),
            ephemeral: false,
        })
    }

    /// Self-signed identity for this run only.
    pub fn ephemeral(subject: &str) -> Self {
        let mut seed_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed_bytes);
        let key = SigningKey::from_bytes(&seed_bytes);
        seed_bytes.zeroize();
        Self {
            key,
            subject: format!("{subject} (ephemeral)"),
            ephemeral: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_seed_for_tests(seed: &str) -> Result<Self> {
        Ok(Self {
            key: signing_key_from_seed(seed)?,
            subject: "test".to_string(),
            ephemeral: false,
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex SHA-256 of the verifying key bytes.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key.verifying_key().as_bytes()))
    }

    pub fn sign_report_hash(&self, report_hash: &[u8; 32]) -> [u8; 64] {
        sign_report_hash(&self.key, report_hash)
    }
}

pub fn sign_report_hash(signing_key: &SigningKey, report_hash: &[u8; 32]) -> [u8; 64] {
    let signing_hash = domain_separated_hash(DOMAIN_REPORT, report_hash);
    signing_key.sign(&signing_hash).to_bytes()
}

pub fn verify_report_signature(
    verifying_key: &VerifyingKey,
    report_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<()> {
    let signing_hash = domain_separated_hash(DOMAIN_REPORT, report_hash);
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(&signing_hash, &sig)
        .map_err(|e| anyhow!("report signature verification failed: {}", e))
}

fn domain_separated_hash(domain: &str, inner_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let domain_bytes = domain.as_bytes();
    hasher.update((domain_bytes.len() as u32).to_le_bytes());
    hasher.update(domain_bytes);
    hasher.update(inner_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_round_trips_and_is_stable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("case.signing.seed");
        let first = load_or_create_seed(&path)?;
        let second = load_or_create_seed(&path)?;
        assert_eq!(first, second);
        assert!(first.starts_with(SEED_PREFIX));
        Ok(())
    }

    #[test]
    fn persistent_identity_is_stable_across_opens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("case.signing.seed");
        let a = SigningIdentity::persistent(&path, "unit pd")?;
        let b = SigningIdentity::persistent(&path, "unit pd")?;
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(!a.is_ephemeral());
        Ok(())
    }

    #[test]
    fn ephemeral_identities_differ_and_are_marked() {
        let a = SigningIdentity::ephemeral("unit pd");
        let b = SigningIdentity::ephemeral("unit pd");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.is_ephemeral());
        assert!(a.subject().contains("ephemeral"));
    }

    #[test]
    fn signature_verifies_and_rejects_tampered_hash() -> Result<()> {
        let identity = SigningIdentity::from_seed_for_tests("custodykey:test")?;
        let report_hash = [7u8; 32];
        let signature = identity.sign_report_hash(&report_hash);
        verify_report_signature(&identity.verifying_key(), &report_hash, &signature)?;

        let mut wrong = report_hash;
        wrong[0] ^= 1;
        assert!(
            verify_report_signature(&identity.verifying_key(), &wrong, &signature).is_err()
        );
        Ok(())
    }
}
