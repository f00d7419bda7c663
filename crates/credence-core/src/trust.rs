//! Trust propagation.
//!
//! [`adjust_trust`] applies a multiplicative, bounded update to one
//! document's `trust_factor` and diffuses a weaker update of the same
//! direction to its semantic neighborhood.
//!
//! # Update rule
//!
//! ```text
//! decrease: t' = max(0, t × (1 − m))
//! increase: t' = min(1, t × (1 + m))
//! ```
//!
//! # Phases
//!
//! 1. **Primary**: atomic read-modify-write of the target's trust.
//! 2. **Read**: resolve the target's representative vector and query up
//!    to `diffusion_limit` neighbors with similarity `>= diffusion_threshold`,
//!    excluding the target itself.
//! 3. **Write**: apply the diffusion update to each neighbor
//!    independently. One hop only; a failed neighbor is recorded in the
//!    report and does not undo or stop the others.
//!
//! Every single-document update is an optimistic compare-and-swap loop
//! against the [`RecordStore`], so concurrent adjustments of the same
//! document never lose an update.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::index::SimilarityIndex;
use crate::models::TrustDirection;
use crate::store::{check_trust, RecordStore};

/// Tuning for one [`adjust_trust`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustParams {
    pub primary_multiplier: f64,
    pub diffusion_multiplier: f64,
    pub diffusion_limit: usize,
    pub diffusion_threshold: f64,
    /// Compare-and-swap attempts per document before giving up.
    pub max_cas_attempts: u32,
}

impl Default for TrustParams {
    fn default() -> Self {
        Self {
            primary_multiplier: 0.05,
            diffusion_multiplier: 0.02,
            diffusion_limit: 15,
            diffusion_threshold: 0.9,
            max_cas_attempts: 16,
        }
    }
}

impl TrustParams {
    fn validate(&self) -> Result<()> {
        for (name, m) in [
            ("primary_multiplier", self.primary_multiplier),
            ("diffusion_multiplier", self.diffusion_multiplier),
        ] {
            if !m.is_finite() || m < 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, m
                )));
            }
        }
        if self.diffusion_threshold.is_nan() {
            return Err(Error::InvalidArgument("diffusion_threshold must be a number".into()));
        }
        if self.max_cas_attempts == 0 {
            return Err(Error::InvalidArgument("max_cas_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Initial trust assigned to newly ingested documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum InitialTrust {
    /// Every document starts at the same value.
    Fixed { value: f64 },
    /// Deterministic pseudo-random value in `[0, 1]` from the SHA-256 of the id.
    Hashed,
}

impl Default for InitialTrust {
    fn default() -> Self {
        Self::Fixed { value: 0.5 }
    }
}

impl InitialTrust {
    pub fn seed(&self, document_id: &str) -> f64 {
        match *self {
            Self::Fixed { value } => value.clamp(0.0, 1.0),
            Self::Hashed => {
                let digest = Sha256::digest(document_id.as_bytes());
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                u64::from_le_bytes(head) as f64 / u64::MAX as f64
            }
        }
    }
}

/// Apply the directional update rule to a single trust value.
pub fn adjusted(trust: f64, direction: TrustDirection, multiplier: f64) -> f64 {
    match direction {
        TrustDirection::Decrease => (trust * (1.0 - multiplier)).max(0.0),
        TrustDirection::Increase => (trust * (1.0 + multiplier)).min(1.0),
    }
}

/// Before/after of one document's trust.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustUpdate {
    pub document_id: String,
    pub before: f64,
    pub after: f64,
    /// Similarity to the target's representative vector (neighbors only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

/// A neighbor whose diffusion update failed.
#[derive(Debug, Serialize)]
pub struct DiffusionFailure {
    pub document_id: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: Error,
}

fn serialize_error<S: serde::Serializer>(err: &Error, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&err.to_string())
}

/// Outcome of [`adjust_trust`].
#[derive(Debug, Serialize)]
pub struct TrustReport {
    pub direction: TrustDirection,
    pub primary: TrustUpdate,
    /// Embedding id used as the target's representative vector, if any.
    pub representative: Option<String>,
    pub neighbors: Vec<TrustUpdate>,
    pub failures: Vec<DiffusionFailure>,
}

/// Adjust a document's trust and diffuse the adjustment one hop.
///
/// # Errors
///
/// - [`Error::NotFound`] if the document does not exist (nothing mutated).
/// - [`Error::InvariantViolation`] if the stored trust is outside `[0, 1]`.
/// - [`Error::InvalidArgument`] for malformed parameters.
///
/// Failures while resolving the neighborhood or updating individual
/// neighbors are reported in [`TrustReport`], never returned, because the
/// primary update has already been applied.
pub async fn adjust_trust<S, I>(
    store: &S,
    index: &I,
    document_id: &str,
    direction: TrustDirection,
    params: &TrustParams,
) -> Result<TrustReport>
where
    S: RecordStore + ?Sized,
    I: SimilarityIndex + ?Sized,
{
    params.validate()?;

    let primary = update_one(
        store,
        document_id,
        direction,
        params.primary_multiplier,
        params.max_cas_attempts,
    )
    .await?;
    debug!(
        document_id,
        before = primary.before,
        after = primary.after,
        "applied primary trust update"
    );

    let mut report = TrustReport {
        direction,
        primary,
        representative: None,
        neighbors: Vec::new(),
        failures: Vec::new(),
    };

    let neighbors = match neighborhood(index, document_id, params).await {
        Ok((representative, neighbors)) => {
            report.representative = representative;
            neighbors
        }
        Err(err) => {
            warn!(document_id, error = %err, "could not resolve trust neighborhood");
            report.failures.push(DiffusionFailure {
                document_id: document_id.to_string(),
                error: err,
            });
            return Ok(report);
        }
    };

    for (neighbor_id, similarity) in neighbors {
        match update_one(
            store,
            &neighbor_id,
            direction,
            params.diffusion_multiplier,
            params.max_cas_attempts,
        )
        .await
        {
            Ok(mut update) => {
                update.similarity = Some(similarity);
                report.neighbors.push(update);
            }
            Err(err) => {
                warn!(document_id = %neighbor_id, error = %err, "diffusion update failed");
                report.failures.push(DiffusionFailure {
                    document_id: neighbor_id,
                    error: err,
                });
            }
        }
    }

    Ok(report)
}

/// Read phase: representative embedding id and `(neighbor_id, similarity)` pairs.
async fn neighborhood<I: SimilarityIndex + ?Sized>(
    index: &I,
    document_id: &str,
    params: &TrustParams,
) -> Result<(Option<String>, Vec<(String, f64)>)> {
    if params.diffusion_limit == 0 {
        return Ok((None, Vec::new()));
    }
    let Some(representative) = index.representative(document_id).await? else {
        debug!(document_id, "document has no embedding; skipping diffusion");
        return Ok((None, Vec::new()));
    };
    let Some(vector) = index.get_vector(&representative).await? else {
        return Ok((None, Vec::new()));
    };

    // one extra slot so a self-match does not cost a neighbor
    let hits = index
        .query(&vector, params.diffusion_limit + 1, params.diffusion_threshold)
        .await?;
    let neighbors = hits
        .into_iter()
        .filter(|n| n.document_id != document_id)
        .take(params.diffusion_limit)
        .map(|n| (n.document_id, n.similarity))
        .collect();
    Ok((Some(representative), neighbors))
}

/// Atomic read-modify-write of a single document's trust.
async fn update_one<S: RecordStore + ?Sized>(
    store: &S,
    document_id: &str,
    direction: TrustDirection,
    multiplier: f64,
    max_attempts: u32,
) -> Result<TrustUpdate> {
    for attempt in 0..max_attempts {
        let current = store
            .load_trust(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;
        if let Err(err) = check_trust(document_id, current.trust_factor) {
            error!(document_id, trust = current.trust_factor, "refusing to adjust corrupted trust");
            return Err(err);
        }

        let next = adjusted(current.trust_factor, direction, multiplier);
        if store
            .compare_and_swap_trust(document_id, current.version, next)
            .await?
        {
            return Ok(TrustUpdate {
                document_id: document_id.to_string(),
                before: current.trust_factor,
                after: next,
                similarity: None,
            });
        }
        debug!(document_id, attempt, "trust compare-and-swap lost a race; retrying");
    }

    Err(Error::Transient(format!(
        "trust update of {} lost {} compare-and-swap races",
        document_id, max_attempts
    )))
}
