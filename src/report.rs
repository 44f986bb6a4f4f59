//! Report content and integrity binding.
//!
//! The report document is frozen first, then hashed, then signed. The
//! integrity result is a sibling value, never part of the hashed bytes, so
//! there is no circular dependency between the hash and signature fields.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

use crate::crypto::SigningIdentity;
use crate::pipeline::{CaseAnalysis, RunDiagnostics};
use crate::timeline::{IncidentRecord, TimelineSummary};
use crate::EvidenceRecord;

/// Finalized report content, serialized as canonical JSON for hashing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseReport {
    pub report_id: Uuid,
    pub case_id: String,
    pub investigator: String,
    pub generated_at: DateTime<Utc>,
    pub evidence: Vec<EvidenceRecord>,
    /// Ledger membership check for the evidence hashes at report time.
    pub ledger_verified: bool,
    pub incidents: Vec<IncidentRecord>,
    pub summary: TimelineSummary,
    pub diagnostics: RunDiagnostics,
}

impl CaseReport {
    pub fn from_analysis(case_id: &str, investigator: &str, analysis: &CaseAnalysis) -> Self {
        Self {
            report_id: Uuid::new_v4(),
            case_id: case_id.to_string(),
            investigator: investigator.to_string(),
            generated_at: Utc::now(),
            evidence: vec![analysis.evidence.clone()],
            ledger_verified: analysis.ledger_verified,
            incidents: analysis.incidents.clone(),
            summary: analysis.summary.clone(),
            diagnostics: analysis.diagnostics.clone(),
        }
    }

    /// The exact bytes the integrity binder hashes. Field order is fixed by
    /// the struct definition; callers must not re-serialize through
    /// intermediate maps.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome of binding a report: hash always present, signature only when
/// signing succeeded. Never a placeholder or stale value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrityResult {
    /// Hex SHA-256 over the finalized report bytes.
    pub report_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_fingerprint: Option<String>,
    /// True when the signing identity was generated for this run only.
    pub ephemeral: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_error: Option<String>,
}

impl IntegrityResult {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.signing_error.is_none()
    }
}

/// Hashes finalized report bytes and signs the hash.
#[derive(Debug)]
pub struct ReportIntegrityBinder {
    identity: Option<SigningIdentity>,
    init_error: Option<String>,
}

impl ReportIntegrityBinder {
    /// Configured seed path ⇒ persistent identity; no path ⇒ ephemeral
    /// self-signed identity for this run. A failure to load key material is
    /// remembered and reported as a signing error at bind time instead of
    /// aborting report production.
    pub fn from_config(seed_path: Option<&Path>, subject: &str) -> Self {
        match seed_path {
            Some(path) => match SigningIdentity::persistent(path, subject) {
                Ok(identity) => Self {
                    identity: Some(identity),
                    init_error: None,
                },
                Err(e) => Self {
                    identity: None,
                    init_error: Some(format!("signing key unavailable: {e}")),
                },
            },
            None => Self {
                identity: Some(SigningIdentity::ephemeral(subject)),
                init_error: None,
            },
        }
    }

    pub fn with_identity(identity: SigningIdentity) -> Self {
        Self {
            identity: Some(identity),
            init_error: None,
        }
    }

    /// Bind finalized content. Must be invoked exactly once, after all other
    /// report fields are frozen.
    pub fn bind(&self, content: &[u8]) -> IntegrityResult {
        let report_hash: [u8; 32] = Sha256::digest(content).into();
        let hash_hex = hex::encode(report_hash);

        let Some(identity) = &self.identity else {
            return IntegrityResult {
                report_hash: hash_hex,
                signature: None,
                signer_subject: None,
                public_key: None,
                public_key_fingerprint: None,
                ephemeral: false,
                signing_error: Some(
                    self.init_error
                        .clone()
                        .unwrap_or_else(|| "no signing identity".to_string()),
                ),
            };
        };

        let signature = identity.sign_report_hash(&report_hash);
        IntegrityResult {
            report_hash: hash_hex,
            signature: Some(hex::encode(signature)),
            signer_subject: Some(identity.subject().to_string()),
            public_key: Some(hex::encode(identity.verifying_key().as_bytes())),
            public_key_fingerprint: Some(identity.fingerprint()),
            ephemeral: identity.is_ephemeral(),
            signing_error: None,
        }
    }
}
