//! Data model (spec §3): `Submission`, `Review`, `Iteration`, `Session`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ThresholdConfig;

/// Inline override carried on a submission's `gan-config` fenced block
/// (spec §6). Unknown keys are ignored by the caller of `parse`; invalid
/// values are dropped (not clamped) so the session's effective defaults
/// apply, with a warning left for the caller to forward to observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigOverride {
    pub task: Option<String>,
    pub threshold: Option<u8>,
    #[serde(rename = "maxCycles")]
    pub max_cycles: Option<u32>,
    pub scope: Option<AuditScope>,
    pub paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditScope {
    Diff,
    Paths,
    Workspace,
}

/// Input to one call of the `audit` RPC (spec §3, transient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub thought: String,
    #[serde(rename = "thoughtNumber")]
    pub thought_number: u32,
    #[serde(rename = "totalThoughts")]
    pub total_thoughts: u32,
    #[serde(rename = "branchId")]
    pub branch_id: Option<String>,
    #[serde(rename = "loopId")]
    pub loop_id: Option<String>,
    pub config: Option<ConfigOverride>,
}

/// Severity of one inline review comment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

/// One inline comment attached to a `Review` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub comment: String,
    pub severity: Severity,
}

/// The fixed set of dimension keys a `Review` must carry (spec §3).
pub const DIMENSION_KEYS: [&str; 6] =
    ["correctness", "tests", "style", "security", "performance", "documentation"];

/// Verdict returned by the external judge (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Revise,
    Reject,
}

/// Output of C3, immutable once produced (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub verdict: Verdict,
    #[serde(rename = "overallScore")]
    pub overall_score: u8,
    pub dimensions: HashMap<String, u8>,
    #[serde(rename = "inlineComments")]
    pub inline_comments: Vec<InlineComment>,
    pub summary: String,
    #[serde(rename = "proposedDiff")]
    pub proposed_diff: Option<String>,
    #[serde(rename = "timedOut", default)]
    pub timed_out: bool,
    #[serde(default)]
    pub partial: bool,
}

impl Review {
    /// Synthesized failure review for exhausted retries that never
    /// captured any partial output (spec §4.4 step 4.d).
    pub fn synthesized_failure(summary: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            overall_score: 0,
            dimensions: DIMENSION_KEYS.iter().map(|k| (k.to_string(), 0)).collect(),
            inline_comments: Vec::new(),
            summary: summary.into(),
            proposed_diff: None,
            timed_out: true,
            partial: false,
        }
    }

    pub fn has_critical_comment(&self) -> bool {
        self.inline_comments.iter().any(|c| c.severity == Severity::Critical)
    }
}

/// One element of a session's append-only history (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    #[serde(rename = "thoughtNumber")]
    pub thought_number: u32,
    #[serde(rename = "totalThoughts", default)]
    pub total_thoughts: u32,
    pub fingerprint: String,
    #[serde(rename = "submittedAt")]
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub review: Review,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    /// The raw thought text this iteration reviewed, kept so the
    /// Completion Evaluator can compare successive thought bodies
    /// without re-reading the submission (spec §4.5: "the last and
    /// previous iterations' thought bodies").
    pub thought: String,
}

/// Stagnation memory (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagnationState {
    #[serde(rename = "startAt")]
    pub start_at: u32,
    #[serde(rename = "similarityThreshold")]
    pub similarity_threshold: f64,
    #[serde(rename = "lastSimilarity")]
    pub last_similarity: Option<f64>,
    pub detected: bool,
    #[serde(rename = "detectedAtLoop")]
    pub detected_at_loop: Option<u32>,
}

impl StagnationState {
    pub fn new(config: &ThresholdConfig) -> Self {
        Self {
            start_at: config.stagnation_start_loop,
            similarity_threshold: config.stagnation_threshold,
            last_similarity: None,
            detected: false,
            detected_at_loop: None,
        }
    }
}

/// Reason a session reached completion (spec §4.5 / §8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CompletionReason {
    Tier1,
    Tier2,
    Tier3,
    HardStop,
    Stagnation,
    CriticalPersist,
    Failed,
}

/// State machine status (spec §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Complete,
    Failed,
}

/// Current schema version of a persisted session snapshot.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Owned by C2, one per `sessionId` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "loopId")]
    pub loop_id: Option<String>,
    #[serde(rename = "contextHandle")]
    pub context_handle: Option<String>,
    #[serde(rename = "currentLoop")]
    pub current_loop: u32,
    pub history: Vec<Iteration>,
    #[serde(rename = "isComplete")]
    pub is_complete: bool,
    #[serde(rename = "completionReason")]
    pub completion_reason: Option<CompletionReason>,
    pub stagnation: StagnationState,
    pub config: ThresholdConfig,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl Session {
    pub fn new(id: String, loop_id: Option<String>, config: ThresholdConfig) -> Self {
        let now = chrono::Utc::now();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            id,
            created_at: now,
            updated_at: now,
            loop_id,
            context_handle: None,
            current_loop: 0,
            history: Vec::new(),
            is_complete: false,
            completion_reason: None,
            stagnation: StagnationState::new(&config),
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.is_complete {
            return SessionState::Active;
        }
        if self.completion_reason == Some(CompletionReason::Failed) {
            SessionState::Failed
        } else {
            SessionState::Complete
        }
    }

    /// Append one iteration. Fails if the session is already terminal
    /// (spec §4.2).
    pub fn append(&mut self, iteration: Iteration) -> Result<(), crate::error::SessionStoreError> {
        if self.is_complete {
            return Err(crate::error::SessionStoreError::AlreadyComplete(self.id.clone()));
        }
        self.current_loop += 1;
        self.history.push(iteration);
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Idempotent mark-complete (spec §4.2): a second call with the same
    /// reason is a no-op; a second call with a different reason fails.
    pub fn mark_complete(
        &mut self,
        reason: CompletionReason,
    ) -> Result<(), crate::error::SessionStoreError> {
        if self.is_complete {
            if self.completion_reason == Some(reason) {
                return Ok(());
            }
            return Err(crate::error::SessionStoreError::AlreadyComplete(self.id.clone()));
        }
        self.is_complete = true;
        self.completion_reason = Some(reason);
        self.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn last_thought(&self) -> Option<&str> {
        self.history.last().map(|it| it.thought.as_str())
    }

    pub fn previous_thought(&self) -> Option<&str> {
        if self.history.len() < 2 {
            return None;
        }
        self.history.get(self.history.len() - 2).map(|it| it.thought.as_str())
    }

    pub fn last_score(&self) -> Option<u8> {
        self.history.last().map(|it| it.review.overall_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ThresholdConfig {
        ThresholdConfig::default()
    }

    fn iteration(n: u32, thought: &str, score: u8) -> Iteration {
        Iteration {
            thought_number: n,
            total_thoughts: n,
            fingerprint: format!("fp{n}"),
            submitted_at: chrono::Utc::now(),
            review: Review {
                verdict: Verdict::Revise,
                overall_score: score,
                dimensions: HashMap::new(),
                inline_comments: Vec::new(),
                summary: String::new(),
                proposed_diff: None,
                timed_out: false,
                partial: false,
            },
            duration_ms: 1,
            thought: thought.to_string(),
        }
    }

    #[test]
    fn history_length_matches_current_loop() {
        let mut s = Session::new("s1".into(), None, cfg());
        for i in 1..=3u32 {
            s.append(iteration(i, "x", 50)).unwrap();
        }
        assert_eq!(s.history.len() as u32, s.current_loop);
    }

    #[test]
    fn append_after_complete_fails() {
        let mut s = Session::new("s1".into(), None, cfg());
        s.append(iteration(1, "x", 50)).unwrap();
        s.mark_complete(CompletionReason::HardStop).unwrap();
        let err = s.append(iteration(2, "y", 50)).unwrap_err();
        assert!(matches!(err, crate::error::SessionStoreError::AlreadyComplete(_)));
    }

    #[test]
    fn mark_complete_same_reason_is_noop() {
        let mut s = Session::new("s1".into(), None, cfg());
        s.append(iteration(1, "x", 95)).unwrap();
        s.mark_complete(CompletionReason::Tier1).unwrap();
        assert!(s.mark_complete(CompletionReason::Tier1).is_ok());
    }

    #[test]
    fn mark_complete_different_reason_fails() {
        let mut s = Session::new("s1".into(), None, cfg());
        s.append(iteration(1, "x", 95)).unwrap();
        s.mark_complete(CompletionReason::Tier1).unwrap();
        let err = s.mark_complete(CompletionReason::HardStop).unwrap_err();
        assert!(matches!(err, crate::error::SessionStoreError::AlreadyComplete(_)));
    }
}
