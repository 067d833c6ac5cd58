// ABOUTME: Per-agent memory of past successes and failures, kept in one JSON file per agent.
// ABOUTME: Lets a worker recall the approach that worked last time for a similar task.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Failed to write agent memory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize agent memory: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub timestamp: jiff::Timestamp,
    pub task_type: String,
    pub description: String,
    pub approach: String,
    #[serde(default)]
    pub outcome: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: jiff::Timestamp,
    pub task_type: String,
    pub description: String,
    pub approach: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Running mean over successes that reported a duration.
    pub average_duration_secs: f64,
    #[serde(default)]
    timed_successes: u64,
}

impl PerformanceStats {
    /// Percentage of recorded tasks that succeeded; 0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.successful_tasks as f64 / self.total_tasks as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default)]
    successes: Vec<SuccessRecord>,
    #[serde(default)]
    failures: Vec<FailureRecord>,
    #[serde(default)]
    stats: PerformanceStats,
}

/// Learned approaches for one agent. Every mutation is written through to disk.
pub struct AgentMemory {
    path: PathBuf,
    state: Mutex<MemoryFile>,
}

impl AgentMemory {
    /// Memory file for `agent_id` inside `dir`.
    pub fn for_agent(dir: &Path, agent_id: &str) -> Self {
        Self::open(dir.join(format!("{}.json", agent_id)))
    }

    /// Load `path`. A missing or unreadable file starts an empty memory.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!(
                    "[Memory] Ignoring corrupt memory file {}: {}",
                    path.display(),
                    e
                );
                MemoryFile::default()
            }),
            Err(_) => MemoryFile::default(),
        };
        log::debug!(
            "[Memory] Loaded {} successes, {} failures from {}",
            state.successes.len(),
            state.failures.len(),
            path.display()
        );
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_success(
        &self,
        task_type: &str,
        description: &str,
        approach: &str,
        outcome: serde_json::Value,
        duration_secs: Option<f64>,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock().await;
        state.successes.push(SuccessRecord {
            timestamp: jiff::Timestamp::now(),
            task_type: task_type.to_string(),
            description: description.to_string(),
            approach: approach.to_string(),
            outcome,
            duration_secs,
        });

        let stats = &mut state.stats;
        stats.total_tasks += 1;
        stats.successful_tasks += 1;
        if let Some(duration) = duration_secs {
            stats.timed_successes += 1;
            let n = stats.timed_successes as f64;
            stats.average_duration_secs += (duration - stats.average_duration_secs) / n;
        }

        self.persist(&state)
    }

    pub async fn record_failure(
        &self,
        task_type: &str,
        description: &str,
        approach: &str,
        error: &str,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock().await;
        state.failures.push(FailureRecord {
            timestamp: jiff::Timestamp::now(),
            task_type: task_type.to_string(),
            description: description.to_string(),
            approach: approach.to_string(),
            error: error.to_string(),
        });
        state.stats.total_tasks += 1;
        state.stats.failed_tasks += 1;

        self.persist(&state)
    }

    /// Best past success for `task_type`.
    ///
    /// With `similar_to`, the success whose description shares the most
    /// words wins (latest on ties). Without it, or with no overlap at all,
    /// the most recent success is returned.
    pub async fn best_approach(
        &self,
        task_type: &str,
        similar_to: Option<&str>,
    ) -> Option<SuccessRecord> {
        let state = self.state.lock().await;
        let relevant: Vec<&SuccessRecord> = state
            .successes
            .iter()
            .filter(|s| s.task_type == task_type)
            .collect();

        if let Some(query) = similar_to {
            let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
            let best = relevant
                .iter()
                .map(|s| {
                    let description = s.description.to_lowercase();
                    let score = words.iter().filter(|w| description.contains(w.as_str())).count();
                    (score, *s)
                })
                .filter(|(score, _)| *score > 0)
                .max_by_key(|(score, _)| *score);
            if let Some((_, record)) = best {
                return Some(record.clone());
            }
        }

        relevant.last().map(|s| (*s).clone())
    }

    pub async fn failures_for(&self, task_type: &str) -> Vec<FailureRecord> {
        let state = self.state.lock().await;
        state
            .failures
            .iter()
            .filter(|f| f.task_type == task_type)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> PerformanceStats {
        self.state.lock().await.stats.clone()
    }

    /// Drop records older than `cutoff`. Stats are lifetime totals and are kept.
    pub async fn prune_before(&self, cutoff: jiff::Timestamp) -> Result<usize, MemoryError> {
        let mut state = self.state.lock().await;
        let before = state.successes.len() + state.failures.len();
        state.successes.retain(|s| s.timestamp >= cutoff);
        state.failures.retain(|f| f.timestamp >= cutoff);
        let removed = before - state.successes.len() - state.failures.len();
        if removed > 0 {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    fn persist(&self, state: &MemoryFile) -> Result<(), MemoryError> {
        let io_err = |source: std::io::Error| MemoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut serialized = serde_json::to_string_pretty(state)?;
        serialized.push('\n');

        // Write beside the target and rename so a crash never leaves half a file.
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serialized).map_err(io_err)?;
        fs::rename(&staging, &self.path).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn successes_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::for_agent(dir.path(), "pm");
        memory
            .record_success(
                "feature_orchestration",
                "Login page",
                "Decomposed into 3 subtasks",
                json!({ "subtasks_created": 3 }),
                Some(4.0),
            )
            .await
            .unwrap();
        assert!(dir.path().join("pm.json").exists());

        let reloaded = AgentMemory::for_agent(dir.path(), "pm");
        let best = reloaded
            .best_approach("feature_orchestration", None)
            .await
            .unwrap();
        assert_eq!(best.approach, "Decomposed into 3 subtasks");
        assert_eq!(best.outcome["subtasks_created"], 3);
        assert_eq!(reloaded.stats().await.successful_tasks, 1);
    }

    #[tokio::test]
    async fn best_approach_prefers_word_overlap_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::for_agent(dir.path(), "pm");
        for (description, approach) in [
            ("User login form", "login approach"),
            ("Orders export", "export approach"),
            ("Invoice search", "search approach"),
        ] {
            memory
                .record_success("feature_orchestration", description, approach, json!({}), None)
                .await
                .unwrap();
        }
        memory
            .record_success("bugfix", "Login crash", "bugfix approach", json!({}), None)
            .await
            .unwrap();

        let similar = memory
            .best_approach("feature_orchestration", Some("Admin LOGIN form"))
            .await
            .unwrap();
        assert_eq!(similar.approach, "login approach");

        let unrelated = memory
            .best_approach("feature_orchestration", Some("dark mode"))
            .await
            .unwrap();
        assert_eq!(unrelated.approach, "search approach");

        assert!(memory.best_approach("deployment", None).await.is_none());
    }

    #[tokio::test]
    async fn stats_track_failures_and_average_duration() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::open(dir.path().join("nested").join("qa.json"));
        memory.record_success("qa", "a", "x", json!(null), Some(2.0)).await.unwrap();
        memory.record_success("qa", "b", "x", json!(null), Some(4.0)).await.unwrap();
        memory.record_success("qa", "c", "x", json!(null), None).await.unwrap();
        memory.record_failure("qa", "d", "x", "flaky").await.unwrap();

        let stats = memory.stats().await;
        assert_eq!(stats.total_tasks, 4);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.average_duration_secs, 3.0);
        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(memory.failures_for("qa").await[0].error, "flaky");
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pm.json"), "{not json").unwrap();
        let memory = AgentMemory::for_agent(dir.path(), "pm");
        assert!(memory.best_approach("feature_orchestration", None).await.is_none());
    }

    #[tokio::test]
    async fn prune_drops_old_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let memory = AgentMemory::for_agent(dir.path(), "pm");
        memory.record_success("qa", "a", "x", json!(null), None).await.unwrap();

        let past = jiff::Timestamp::now() - jiff::SignedDuration::from_hours(24);
        assert_eq!(memory.prune_before(past).await.unwrap(), 0);

        let future = jiff::Timestamp::now() + jiff::SignedDuration::from_hours(1);
        assert_eq!(memory.prune_before(future).await.unwrap(), 1);
        assert_eq!(memory.stats().await.successful_tasks, 1);
    }
}
