//! External Judge Driver (C3, spec §4.3).
//!
//! Spawns and manages the lifetime of the external analyzer CLI. The
//! driver imposes no concurrency cap of its own (the Orchestrator's
//! job); it tracks active children for observability and force-
//! terminates everything on shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::JudgeConfig;
use crate::error::JudgeError;
use crate::session::{AuditScope, InlineComment, Review, Severity, Verdict};

/// Substrings that mark an env var / CLI arg as sensitive; such values
/// are redacted in logs only, never in what's actually passed to the
/// child (spec §4.3).
const SECRET_NAME_SUBSTRINGS: [&str; 5] = ["token", "key", "secret", "password", "credential"];

fn redact_for_log(name: &str, value: &str) -> String {
    let lowered = name.to_ascii_lowercase();
    if SECRET_NAME_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        "<redacted>".to_string()
    } else {
        value.to_string()
    }
}

fn redact_command_for_log(executable: &str, args: &[String]) -> String {
    let redacted_args: Vec<String> = args
        .iter()
        .map(|a| {
            if let Some((k, v)) = a.split_once('=') {
                format!("{k}={}", redact_for_log(k, v))
            } else {
                a.clone()
            }
        })
        .collect();
    format!("{executable} {}", redacted_args.join(" "))
}

/// One audit request handed to `Audit` (spec §4.3: "request carries the
/// packed code artifact plus the task description").
#[derive(Debug, Clone, Serialize)]
pub struct AuditRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub thought: String,
    pub task: Option<String>,
    pub threshold: u8,
    #[serde(rename = "workingDir")]
    pub working_dir: Option<PathBuf>,
    pub scope: Option<AuditScope>,
    pub paths: Option<Vec<String>>,
}

/// Raw shape the analyzer's stdout must contain at minimum (spec §6):
/// `verdict`, `overall`, `dimensions`, `review.inline[]`, `review.summary`.
/// Extra fields are preserved-but-ignored by using `#[serde(default)]`
/// rather than `deny_unknown_fields`.
#[derive(Debug, Deserialize)]
struct RawJudgeOutput {
    verdict: String,
    overall: u8,
    #[serde(default)]
    dimensions: HashMap<String, u8>,
    review: RawReviewBody,
    #[serde(rename = "proposedDiff", default)]
    proposed_diff: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawReviewBody {
    #[serde(default)]
    inline: Vec<RawInlineComment>,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct RawInlineComment {
    path: String,
    line: u32,
    comment: String,
    #[serde(default = "default_severity")]
    severity: String,
}

fn default_severity() -> String {
    "info".to_string()
}

fn parse_verdict(s: &str) -> Verdict {
    match s.to_ascii_lowercase().as_str() {
        "pass" => Verdict::Pass,
        "reject" => Verdict::Reject,
        _ => Verdict::Revise,
    }
}

fn parse_severity(s: &str) -> Severity {
    match s.to_ascii_lowercase().as_str() {
        "critical" => Severity::Critical,
        "major" => Severity::Major,
        "minor" => Severity::Minor,
        _ => Severity::Info,
    }
}

/// Parse the child's stdout into a `Review`, tolerating malformed output
/// gracefully: direct JSON first, then a fenced ```json block, then
/// brace-matching — the same fallback chain this repository already
/// uses to parse LLM responses.
fn parse_review(stdout: &str, timed_out: bool, partial: bool) -> Result<Review, JudgeError> {
    let candidate = extract_json_block(stdout).unwrap_or(stdout);
    let raw: RawJudgeOutput = serde_json::from_str(candidate)
        .map_err(|e| JudgeError::BadOutput(format!("{e}: stdout head = {:.200}", stdout)))?;

    let inline_comments = raw
        .review
        .inline
        .into_iter()
        .map(|c| InlineComment {
            path: c.path,
            line: c.line,
            comment: c.comment,
            severity: parse_severity(&c.severity),
        })
        .collect();

    Ok(Review {
        verdict: parse_verdict(&raw.verdict),
        overall_score: raw.overall,
        dimensions: raw.dimensions,
        inline_comments,
        summary: raw.review.summary,
        proposed_diff: raw.proposed_diff,
        timed_out,
        partial,
    })
}

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

fn extract_json_block(text: &str) -> Option<&str> {
    if serde_json::from_str::<serde_json::Value>(text.trim()).is_ok() {
        return None; // caller will parse `text` directly
    }
    if let Some(caps) = FENCE_RE.captures(text)
        && let Some(m) = caps.get(1)
    {
        return Some(m.as_str().trim());
    }
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
        && end > start
    {
        return Some(&text[start..=end]);
    }
    None
}

/// Opaque handle into a per-`loopId` long-lived analyzer context window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle(pub String);

struct ChildEntry {
    child: Child,
}

/// Drives the external analyzer CLI child process.
pub struct JudgeDriver {
    config: JudgeConfig,
    active_children: Arc<Mutex<HashMap<String, ChildEntry>>>,
    next_handle_id: AtomicU64,
}

impl JudgeDriver {
    pub fn new(config: JudgeConfig) -> Self {
        Self {
            config,
            active_children: Arc::new(Mutex::new(HashMap::new())),
            next_handle_id: AtomicU64::new(1),
        }
    }

    pub async fn active_children_count(&self) -> usize {
        self.active_children.lock().await.len()
    }

    /// Probe whether the analyzer is present and responsive (spec §4.3:
    /// `CheckAvailable`). Bounded timeout, no retries.
    pub async fn check_available(&self) -> Result<String, JudgeError> {
        let executable = self.config.executable.to_string_lossy().to_string();
        let mut cmd = Command::new(&executable);
        cmd.arg("version").stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let spawned = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JudgeError::NotFound(executable.clone())
            } else {
                JudgeError::Io(e.to_string())
            }
        })?;

        let wait = timeout(
            Duration::from_millis(self.config.check_available_timeout_ms),
            spawned.wait_with_output(),
        )
        .await;

        match wait {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(Ok(output)) => Err(JudgeError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
            }),
            Ok(Err(e)) => Err(JudgeError::Io(e.to_string())),
            Err(_) => Err(JudgeError::Timeout {
                command: redact_command_for_log(&executable, &["version".to_string()]),
                duration_ms: self.config.check_available_timeout_ms,
            }),
        }
    }

    /// Start a persistent per-`loopId` context. Failure here is
    /// non-fatal to the outer audit (spec §4.3).
    pub async fn start_context(&self, loop_id: &str) -> Option<ContextHandle> {
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let handle = ContextHandle(format!("{loop_id}-{id}"));
        let executable = self.config.executable.to_string_lossy().to_string();

        let mut cmd = Command::new(&executable);
        cmd.args(["context", "start", "--handle", &handle.0])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(child) => {
                self.active_children.lock().await.insert(handle.0.clone(), ChildEntry { child });
                Some(handle)
            }
            Err(e) => {
                warn!(loop_id, error = %e, "StartContext failed, proceeding without context reuse");
                None
            }
        }
    }

    /// Terminate a context handle. Idempotent: succeeds even if the
    /// child is already gone (spec §4.3).
    pub async fn terminate_context(&self, handle: &ContextHandle, reason: &str) {
        let mut children = self.active_children.lock().await;
        if let Some(mut entry) = children.remove(&handle.0) {
            debug!(handle = %handle.0, reason, "terminating context");
            let _ = entry.child.start_kill();
            let _ = timeout(Duration::from_millis(self.config.kill_grace_ms), entry.child.wait()).await;
        }
    }

    /// Run one audit (spec §4.3: `Audit`). `deadline` is an absolute
    /// time; on expiry the driver sends a graceful signal, waits a
    /// short grace window, then force-kills, returning a partial review
    /// if any stdout was captured.
    pub async fn audit(
        &self,
        request: &AuditRequest,
        handle: Option<&ContextHandle>,
        deadline: Instant,
    ) -> Result<Review, JudgeError> {
        let executable = self.config.executable.to_string_lossy().to_string();
        let payload = serde_json::to_vec(request).map_err(|e| JudgeError::Io(e.to_string()))?;

        let mut args = vec!["audit".to_string()];
        if let Some(h) = handle {
            args.push("--context".to_string());
            args.push(h.0.clone());
        }

        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JudgeError::NotFound(executable.clone())
            } else {
                JudgeError::Io(e.to_string())
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        }

        let key = format!("{}-{}", request.session_id, self.next_handle_id.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();
        let time_left = deadline.saturating_duration_since(Instant::now());

        // Wait for exit status only (`&mut self`, does not consume `child`),
        // so `child` is still ours to read stdout/stderr from on success or
        // to hand to `grace_then_kill` on timeout — never moved twice.
        let wait_result = timeout(time_left, child.wait()).await;

        match wait_result {
            Ok(Ok(status)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let mut stdout_buf = Vec::new();
                let mut stderr_buf = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = out.read_to_end(&mut stdout_buf).await;
                }
                if let Some(mut err) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = err.read_to_end(&mut stderr_buf).await;
                }
                let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
                if !status.success() && stdout.trim().is_empty() {
                    return Err(JudgeError::NonZeroExit {
                        code: status.code().unwrap_or(-1),
                        stderr_tail: tail(&String::from_utf8_lossy(&stderr_buf)),
                    });
                }
                if stdout.trim().is_empty() {
                    return Err(JudgeError::BadOutput("empty stdout".to_string()));
                }
                debug!(
                    command = %redact_command_for_log(&executable, &args),
                    duration_ms,
                    "audit completed"
                );
                parse_review(&stdout, false, false)
            }
            Ok(Err(e)) => Err(JudgeError::Io(e.to_string())),
            Err(_) => {
                // Deadline expired: graceful signal, short grace, then force-kill.
                self.active_children.lock().await.insert(key.clone(), ChildEntry { child });
                let partial_stdout = self.grace_then_kill(&key).await;
                match partial_stdout.and_then(|s| parse_review(&s, true, true).ok()) {
                    Some(review) => Ok(review),
                    None => Err(JudgeError::Timeout {
                        command: redact_command_for_log(&executable, &args),
                        duration_ms: self.config.kill_grace_ms,
                    }),
                }
            }
        }
    }

    async fn grace_then_kill(&self, key: &str) -> Option<String> {
        let mut children = self.active_children.lock().await;
        let mut entry = children.remove(key)?;
        drop(children);

        let _ = entry.child.start_kill();
        let grace = Duration::from_millis(self.config.kill_grace_ms);

        let mut partial = None;
        if let Some(mut stdout) = entry.child.stdout.take() {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = timeout(grace, stdout.read_to_end(&mut buf)).await;
            if !buf.is_empty() {
                partial = Some(String::from_utf8_lossy(&buf).to_string());
            }
        }
        let _ = timeout(grace, entry.child.wait()).await;
        partial
    }

    /// Force-terminate all active children within a bounded grace
    /// period (spec §4.3: shutdown policy).
    pub async fn shutdown(&self) {
        let mut children = self.active_children.lock().await;
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        for (_, mut entry) in children.drain() {
            let _ = entry.child.start_kill();
            let _ = timeout(grace, entry.child.wait()).await;
        }
    }
}

fn tail(s: &str) -> String {
    const MAX: usize = 2048;
    if s.len() <= MAX {
        s.to_string()
    } else {
        s[s.len() - MAX..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_review_direct_json() {
        let stdout = r#"{"verdict":"pass","overall":97,"dimensions":{"correctness":98},"review":{"inline":[],"summary":"looks good"}}"#;
        let review = parse_review(stdout, false, false).unwrap();
        assert_eq!(review.verdict, Verdict::Pass);
        assert_eq!(review.overall_score, 97);
        assert_eq!(review.summary, "looks good");
    }

    #[test]
    fn parse_review_from_fenced_block() {
        let stdout = "Some preamble\n```json\n{\"verdict\":\"revise\",\"overall\":60,\"review\":{\"inline\":[{\"path\":\"a.rs\",\"line\":3,\"comment\":\"fix\",\"severity\":\"critical\"}],\"summary\":\"needs work\"}}\n```\ntrailing";
        let review = parse_review(stdout, false, false).unwrap();
        assert_eq!(review.verdict, Verdict::Revise);
        assert!(review.has_critical_comment());
    }

    #[test]
    fn empty_stdout_is_bad_output() {
        let err = parse_review("", false, false).unwrap_err();
        assert!(matches!(err, JudgeError::BadOutput(_)));
    }

    #[test]
    fn redacts_secret_looking_args_in_logs() {
        let cmd = redact_command_for_log("gans-analyzer", &["api_key=abc123".to_string()]);
        assert!(cmd.contains("<redacted>"));
        assert!(!cmd.contains("abc123"));
    }
}
