//! Session Store (C2, spec §4.2).
//!
//! Owns `Session` records in memory behind a coarse map mutex plus one
//! mutex per live session, and persists snapshots to disk with an
//! atomic write-to-temp-then-rename, mirroring this repository's
//! existing state-persistence convention (`OrchestrationState::save`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::ThresholdConfig;
use crate::error::SessionStoreError;
use crate::session::{CompletionReason, Iteration, Session};

/// A handle to a live session, held under its own per-session lock for
/// the duration of one audit. Dropping it releases the lock (spec §5:
/// "no operation may hold more than one session lock at a time").
pub struct SessionGuard {
    pub session: Session,
    _lock: OwnedMutexGuard<()>,
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;
    fn deref(&self) -> &Session {
        &self.session
    }
}

impl std::ops::DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

struct Entry {
    lock: Arc<Mutex<()>>,
}

/// In-memory + durable Session Store.
pub struct SessionStore {
    state_dir: PathBuf,
    max_active_sessions: usize,
    max_session_age: Duration,
    default_thresholds: ThresholdConfig,
    /// Coarse mutex over the session-id -> per-session-lock map. Never
    /// held across I/O (spec §5).
    locks: Mutex<HashMap<String, Entry>>,
}

impl SessionStore {
    pub fn new(
        state_dir: PathBuf,
        max_active_sessions: usize,
        max_session_age: Duration,
        default_thresholds: ThresholdConfig,
    ) -> Self {
        Self {
            state_dir,
            max_active_sessions,
            max_session_age,
            default_thresholds,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{id}.json"))
    }

    /// Acquire (creating if absent) the per-session lock, then load or
    /// create the session. Two concurrent callers with the same id see
    /// exactly one creation (spec §4.2: `GetOrCreate`).
    pub async fn get_or_create(
        &self,
        id: &str,
        loop_id: Option<String>,
    ) -> Result<(SessionGuard, bool), SessionStoreError> {
        let per_session_lock = {
            let mut locks = self.locks.lock().await;
            if !locks.contains_key(id) {
                if locks.len() >= self.max_active_sessions && !self.snapshot_path(id).exists() {
                    return Err(SessionStoreError::Capacity(self.max_active_sessions));
                }
                locks.insert(id.to_string(), Entry { lock: Arc::new(Mutex::new(())) });
            }
            locks.get(id).unwrap().lock.clone()
        };

        let owned_lock = per_session_lock.lock_owned().await;

        match self.load_from_disk(id).await {
            Ok(Some(session)) => Ok((SessionGuard { session, _lock: owned_lock }, false)),
            Ok(None) => {
                let session = Session::new(id.to_string(), loop_id, self.default_thresholds.clone());
                Ok((SessionGuard { session, _lock: owned_lock }, true))
            }
            Err(e) => {
                warn!(session_id = id, error = %e, "snapshot load failed, quarantined; treating as not found");
                let session = Session::new(id.to_string(), loop_id, self.default_thresholds.clone());
                Ok((SessionGuard { session, _lock: owned_lock }, true))
            }
        }
    }

    /// Load a session purely from durable storage, bypassing the
    /// in-memory lock map (spec §4.2: `Load`).
    pub async fn load(&self, id: &str) -> Result<Session, SessionStoreError> {
        self.load_from_disk(id)
            .await
            .map_err(|e| SessionStoreError::SnapshotFailed(e.to_string()))?
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))
    }

    async fn load_from_disk(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let path = self.snapshot_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                let corrupt_path = path.with_extension("json.corrupt");
                let _ = tokio::fs::rename(&path, &corrupt_path).await;
                anyhow::bail!("corrupted snapshot quarantined as {}: {e}", corrupt_path.display());
            }
        }
    }

    /// Append an iteration to a held session and persist a new snapshot
    /// (spec §4.2: `Append` + `Snapshot`).
    pub async fn append(
        &self,
        guard: &mut SessionGuard,
        iteration: Iteration,
    ) -> Result<(), SessionStoreError> {
        guard.session.append(iteration)?;
        self.snapshot(&guard.session).await
    }

    /// Idempotent mark-complete plus persistence (spec §4.2:
    /// `MarkComplete`).
    pub async fn mark_complete(
        &self,
        guard: &mut SessionGuard,
        reason: CompletionReason,
    ) -> Result<(), SessionStoreError> {
        guard.session.mark_complete(reason)?;
        self.snapshot(&guard.session).await
    }

    /// Persist the session's current state atomically: write to a temp
    /// file, then rename over the target. Retries a bounded number of
    /// times on transient I/O failure (spec §4.2's failure semantics);
    /// the in-memory mutation above has already succeeded regardless of
    /// whether this returns `Ok`.
    pub async fn snapshot(&self, session: &Session) -> Result<(), SessionStoreError> {
        const MAX_ATTEMPTS: u32 = 3;

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| SessionStoreError::SnapshotFailed(e.to_string()))?;

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.write_atomic(&session.id, &json).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session_id = %session.id, attempt, error = %e, "snapshot write failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(SessionStoreError::SnapshotFailed(last_err.unwrap().to_string()))
    }

    async fn write_atomic(&self, id: &str, json: &[u8]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let final_path = self.snapshot_path(id);
        let temp_path = self.state_dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    /// Delete snapshots older than `maxSessionAge`; does not evict
    /// sessions currently held by a live lock (spec §4.2: `Reap`).
    pub async fn reap(&self) -> anyhow::Result<usize> {
        let mut reaped = 0usize;
        if !self.state_dir.exists() {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata.modified()?;
            if modified.elapsed().unwrap_or_default() > self.max_session_age {
                let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                let held = {
                    let locks = self.locks.lock().await;
                    // strong_count > 1 means a `SessionGuard` elsewhere still
                    // holds this session's lock via its `OwnedMutexGuard`.
                    locks.get(id).map(|e| Arc::strong_count(&e.lock) > 1).unwrap_or(false)
                };
                if held {
                    continue;
                }
                if tokio::fs::remove_file(&path).await.is_ok() {
                    reaped += 1;
                    self.locks.lock().await.remove(id);
                    info!(session_id = id, "reaped stale session snapshot");
                }
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Review, Verdict};
    use std::collections::HashMap as StdHashMap;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(dir.to_path_buf(), 256, Duration::from_secs(3600), ThresholdConfig::default())
    }

    fn iteration(n: u32) -> Iteration {
        Iteration {
            thought_number: n,
            total_thoughts: n,
            fingerprint: format!("fp{n}"),
            submitted_at: chrono::Utc::now(),
            review: Review {
                verdict: Verdict::Revise,
                overall_score: 50,
                dimensions: StdHashMap::new(),
                inline_comments: Vec::new(),
                summary: String::new(),
                proposed_diff: None,
                timed_out: false,
                partial: false,
            },
            duration_ms: 1,
            thought: "x".into(),
        }
    }

    #[tokio::test]
    async fn get_or_create_reports_created_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (guard, created) = store.get_or_create("s1", None).await.unwrap();
        assert!(created);
        drop(guard);
        let (_guard2, created2) = store.get_or_create("s1", None).await.unwrap();
        assert!(!created2, "second load should rehydrate, not recreate");
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (mut guard, _) = store.get_or_create("s1", None).await.unwrap();
        store.append(&mut guard, iteration(1)).await.unwrap();
        drop(guard);

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.current_loop, 1);
        assert_eq!(loaded.history.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn reap_prunes_the_lock_entry_once_snapshot_and_guard_are_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let (guard, _) = store.get_or_create("s1", None).await.unwrap();
        drop(guard);

        let old = std::time::SystemTime::now() - Duration::from_secs(10_000);
        let path = dir.path().join("s1.json");
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(old).unwrap();

        let store = SessionStore::new(
            dir.path().to_path_buf(),
            256,
            Duration::from_secs(1),
            ThresholdConfig::default(),
        );
        let reaped = store.reap().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(!store.locks.lock().await.contains_key("s1"), "lock entry should be pruned after reap");
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_quarantined_and_treated_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("s1.json"), b"not json").await.unwrap();

        let store = store(dir.path());
        let (_guard, created) = store.get_or_create("s1", None).await.unwrap();
        assert!(created);
        assert!(dir.path().join("s1.json.corrupt").exists());
    }
}
