//! Run-state tracker: the processing boundary and processed-ID set.
//!
//! `begin_run()` yields the fetch boundary; `commit_run()` is the last step
//! of a successful run. Nothing is written if a run aborts, so the next run
//! redoes the same work.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RunStateError;

/// Durable record of what earlier runs completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Boundary committed by the last successful run.
    #[serde(default)]
    pub last_run_timestamp: Option<DateTime<Utc>>,
    /// Reconciled message IDs, keyed to their received time for pruning.
    #[serde(default)]
    pub processed_message_ids: BTreeMap<String, DateTime<Utc>>,
}

/// Where the run state lives.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Load the state, or the empty state on first run.
    async fn load(&self) -> Result<RunState, RunStateError>;

    /// Replace the state. Must be atomic.
    async fn save(&self, state: &RunState) -> Result<(), RunStateError>;
}

/// JSON file store. Writes go to a temp sibling and are renamed into place.
pub struct FileRunStateStore {
    path: PathBuf,
}

impl FileRunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunStateStore for FileRunStateStore {
    async fn load(&self) -> Result<RunState, RunStateError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RunStateError::Load(format!("{}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No run state yet, starting fresh");
                Ok(RunState::default())
            }
            Err(e) => Err(RunStateError::Load(format!("{}: {e}", self.path.display()))),
        }
    }

    async fn save(&self, state: &RunState) -> Result<(), RunStateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let payload = serde_json::to_vec_pretty(state)
            .map_err(|e| RunStateError::Save(format!("encode: {e}")))?;

        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|e| RunStateError::Save(format!("write {}: {e}", temp_path.display())))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(RunStateError::Save(format!(
                "finalize {}: {e}",
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), "Run state saved");
        Ok(())
    }
}

/// In-process store, for tests and dry runs.
#[derive(Default)]
pub struct MemoryRunStateStore {
    state: tokio::sync::Mutex<RunState>,
}

impl MemoryRunStateStore {
    pub async fn snapshot(&self) -> RunState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn load(&self) -> Result<RunState, RunStateError> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &RunState) -> Result<(), RunStateError> {
        *self.state.lock().await = state.clone();
        Ok(())
    }
}

/// Boundary settings.
#[derive(Debug, Clone)]
pub struct RunStateConfig {
    /// Fetch window on the very first run.
    pub initial_lookback: Duration,
    /// Subtracted from the committed boundary to tolerate clock skew and
    /// late delivery.
    pub overlap: Duration,
    /// How long processed IDs are remembered.
    pub retention: Duration,
}

impl Default for RunStateConfig {
    fn default() -> Self {
        Self {
            initial_lookback: Duration::hours(24),
            overlap: Duration::minutes(60),
            retention: Duration::days(14),
        }
    }
}

/// What a run may fetch.
#[derive(Debug, Clone)]
pub struct RunBoundary {
    /// Fetch messages received at or after this instant.
    pub since: DateTime<Utc>,
    /// Messages already reconciled; never reach the resolver again.
    pub excluded_ids: HashSet<String>,
    /// When the run began. The default next boundary.
    pub started_at: DateTime<Utc>,
}

/// Reads the boundary at run start and commits it at run end.
pub struct RunStateTracker {
    store: Arc<dyn RunStateStore>,
    config: RunStateConfig,
}

impl RunStateTracker {
    pub fn new(store: Arc<dyn RunStateStore>, config: RunStateConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RunStateConfig {
        &self.config
    }

    /// Compute the fetch boundary for a run starting at `now`.
    pub async fn begin_run(&self, now: DateTime<Utc>) -> Result<RunBoundary, RunStateError> {
        let state = self.store.load().await?;
        let since = match state.last_run_timestamp {
            Some(last) => last - self.config.overlap,
            None => now - self.config.initial_lookback,
        };
        let excluded_ids: HashSet<String> = state.processed_message_ids.into_keys().collect();
        info!(
            since = %since.to_rfc3339(),
            excluded = excluded_ids.len(),
            "Run boundary computed"
        );
        Ok(RunBoundary {
            since,
            excluded_ids,
            started_at: now,
        })
    }

    /// Persist the new boundary and the IDs reconciled in this run.
    ///
    /// IDs received before `new_timestamp - max(retention, overlap)` can no
    /// longer be refetched and are pruned.
    pub async fn commit_run<I>(
        &self,
        new_timestamp: DateTime<Utc>,
        newly_processed: I,
    ) -> Result<RunState, RunStateError>
    where
        I: IntoIterator<Item = (String, DateTime<Utc>)>,
    {
        let mut state = self.store.load().await?;
        state.processed_message_ids.extend(newly_processed);

        let horizon = new_timestamp - self.config.retention.max(self.config.overlap);
        let before = state.processed_message_ids.len();
        state
            .processed_message_ids
            .retain(|_, received_at| *received_at >= horizon);
        let pruned = before - state.processed_message_ids.len();

        state.last_run_timestamp = Some(new_timestamp);
        self.store.save(&state).await?;
        info!(
            boundary = %new_timestamp.to_rfc3339(),
            tracked = state.processed_message_ids.len(),
            pruned,
            "Run committed"
        );
        Ok(state)
    }
}

/// Exclusive advisory lock held for the duration of a run.
///
/// Released when dropped or when the process exits.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail immediately with `RunInProgress`.
    pub fn acquire(path: &Path) -> Result<Self, RunStateError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(RunStateError::RunInProgress {
                    path: path.display().to_string(),
                });
            }
            return Err(RunStateError::Io(e));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), "Run lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Run lock released");
    }
}
