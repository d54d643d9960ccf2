// # Rule Applier Trait
//
// Defines the interface for loading a rendered rule-set document into the
// packet filter.
//
// ## Implementations
//
// - nft subprocess: `dnat-backend-nft` crate
// - Recording mock for tests: `tests/common`

use crate::ruleset::RulesetDocument;
use async_trait::async_trait;

/// Result of one attempt to load a rendered rule set
///
/// Failure is an expected outcome, not an error: the loop logs it and
/// moves on, and the rendered document still becomes the next baseline.
/// That keeps a persistently-failing apply from being retried every cycle
/// while the content is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The external tool accepted the rule set (zero exit status)
    Applied,
    /// The external tool rejected the rule set, timed out, or could not
    /// be run at all
    Failed {
        /// Captured output or error description, for the log line
        detail: String,
    },
}

impl ApplyOutcome {
    /// Create a `Failed` outcome
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }

    /// Whether the rule set was accepted
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Trait for rule applier implementations
///
/// One invocation per changed rule set: persist the document to the
/// well-known location, then ask the external tool to load it, bounded by
/// a short timeout. Appliers never retry and never decide whether an
/// apply is needed; both are owned by the engine.
///
/// # Thread Safety
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait RuleApplier: Send + Sync {
    /// Persist and load a rendered rule set.
    ///
    /// # Parameters
    ///
    /// - `document`: the complete rule-set text to apply
    ///
    /// # Returns
    ///
    /// `ApplyOutcome::Applied` on a zero exit status, otherwise
    /// `ApplyOutcome::Failed` carrying whatever detail is available.
    /// Infrastructure problems (the rule file cannot be written, the tool
    /// cannot be spawned) are also `Failed`, never a panic or an `Err`.
    async fn apply(&self, document: &RulesetDocument) -> ApplyOutcome;

    /// Backend name for log lines (e.g. "nft")
    fn name(&self) -> &'static str;
}
