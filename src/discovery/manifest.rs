//! Discovery manifest: schema-versioned record of what tasks/scheduled
//! tasks were found on disk, plus a diff against the previous manifest
//! (`spec.md` §6).
//!
//! Grounded on `original_source/nuvom/discovery/manifest.py`'s
//! `ManifestManager` (load/save/diff_and_save, `module_name or file_path`
//! keying). No AST walker here: this module only owns the manifest
//! document and its diff, not the filesystem scan that populates it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NuvomError, Result};

const MANIFEST_VERSION: &str = "1.0";

/// Where a discovered task lives. `module_name` is the dotted path used
/// as the diff key when present, falling back to `file_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReference {
    pub file_path: String,
    pub func_name: String,
    pub module_name: Option<String>,
}

impl TaskReference {
    pub fn new(file_path: impl Into<String>, func_name: impl Into<String>, module_name: Option<String>) -> Self {
        Self {
            file_path: file_path.into(),
            func_name: func_name.into(),
            module_name,
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.module_name.as_deref().unwrap_or(&self.file_path), self.func_name)
    }
}

/// Schedule fields attached to a scheduled task's manifest entry
/// (`spec.md` §6: "same + `metadata` with schedule fields").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMetadata {
    pub schedule_type: String,
    pub cron_expr: Option<String>,
    pub interval_secs: Option<u64>,
    pub run_at: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTaskReference {
    #[serde(flatten)]
    pub task: TaskReference,
    pub metadata: ScheduleMetadata,
}

/// The manifest document as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: String,
    #[serde(default)]
    pub tasks: Vec<TaskReference>,
    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTaskReference>,
}

impl ManifestDocument {
    pub fn new(tasks: Vec<TaskReference>, scheduled_tasks: Vec<ScheduledTaskReference>) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            tasks,
            scheduled_tasks,
        }
    }
}

/// What changed between the previous manifest on disk and a freshly
/// scanned set of tasks (`spec.md` §6: "additions/removals/modifications
/// keyed by `module:func_name`").
#[derive(Debug, Default)]
pub struct ManifestDiff {
    pub tasks_added: Vec<TaskReference>,
    pub tasks_removed: Vec<TaskReference>,
    pub tasks_modified: Vec<TaskReference>,
    pub scheduled_added: Vec<ScheduledTaskReference>,
    pub scheduled_removed: Vec<ScheduledTaskReference>,
    pub scheduled_modified: Vec<ScheduledTaskReference>,
    pub saved: bool,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.tasks_added.is_empty()
            && self.tasks_removed.is_empty()
            && self.tasks_modified.is_empty()
            && self.scheduled_added.is_empty()
            && self.scheduled_removed.is_empty()
            && self.scheduled_modified.is_empty()
    }
}

/// Reads/writes the manifest file and computes diffs against it.
pub struct ManifestManager {
    path: PathBuf,
}

impl ManifestManager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Default location, mirroring the original's `.nuvom/manifest.json`.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".nuvom/manifest.json")
    }

    /// Loads the manifest, or an empty one if the file doesn't exist.
    /// A schema version mismatch is a hard error (`spec.md` §7
    /// `VersionMismatch`).
    pub async fn load(&self) -> Result<ManifestDocument> {
        if !self.path.exists() {
            return Ok(ManifestDocument::new(Vec::new(), Vec::new()));
        }
        let bytes = tokio::fs::read(&self.path).await?;
        let doc: ManifestDocument = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "manifest file is not valid JSON, treating as empty");
                return Ok(ManifestDocument::new(Vec::new(), Vec::new()));
            }
        };
        if doc.version != MANIFEST_VERSION {
            return Err(NuvomError::version_mismatch("manifest", &doc.version, MANIFEST_VERSION));
        }
        Ok(doc)
    }

    pub async fn save(&self, doc: &ManifestDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    /// Compare a freshly scanned set of tasks/scheduled tasks against the
    /// manifest on disk; if anything changed, persist the new set.
    pub async fn diff_and_save(
        &self,
        new_tasks: Vec<TaskReference>,
        new_scheduled: Vec<ScheduledTaskReference>,
    ) -> Result<ManifestDiff> {
        let old = self.load().await?;

        let mut diff = ManifestDiff::default();
        diff_tasks(&old.tasks, &new_tasks, &mut diff);
        diff_scheduled(&old.scheduled_tasks, &new_scheduled, &mut diff);

        diff.saved = !diff.is_empty();
        if diff.saved {
            self.save(&ManifestDocument::new(new_tasks, new_scheduled)).await?;
        }
        Ok(diff)
    }
}

fn diff_tasks(old: &[TaskReference], new: &[TaskReference], diff: &mut ManifestDiff) {
    use std::collections::HashMap;
    let old_by_key: HashMap<String, &TaskReference> = old.iter().map(|t| (t.key(), t)).collect();
    let new_by_key: HashMap<String, &TaskReference> = new.iter().map(|t| (t.key(), t)).collect();

    for (key, t) in &new_by_key {
        match old_by_key.get(key) {
            None => diff.tasks_added.push((*t).clone()),
            Some(old_t) if old_t.file_path != t.file_path || old_t.module_name != t.module_name => {
                diff.tasks_modified.push((*t).clone());
            }
            Some(_) => {}
        }
    }
    for (key, t) in &old_by_key {
        if !new_by_key.contains_key(key) {
            diff.tasks_removed.push((*t).clone());
        }
    }
}

fn diff_scheduled(old: &[ScheduledTaskReference], new: &[ScheduledTaskReference], diff: &mut ManifestDiff) {
    use std::collections::HashMap;
    let old_by_key: HashMap<String, &ScheduledTaskReference> = old.iter().map(|t| (t.task.key(), t)).collect();
    let new_by_key: HashMap<String, &ScheduledTaskReference> = new.iter().map(|t| (t.task.key(), t)).collect();

    for (key, t) in &new_by_key {
        match old_by_key.get(key) {
            None => diff.scheduled_added.push((*t).clone()),
            Some(old_t) if location_or_schedule_changed(old_t, t) => diff.scheduled_modified.push((*t).clone()),
            Some(_) => {}
        }
    }
    for (key, t) in &old_by_key {
        if !new_by_key.contains_key(key) {
            diff.scheduled_removed.push((*t).clone());
        }
    }
}

fn location_or_schedule_changed(old: &ScheduledTaskReference, new: &ScheduledTaskReference) -> bool {
    old.task.file_path != new.task.file_path || old.task.module_name != new.task.module_name || old.metadata != new.metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(path: &str, func: &str) -> TaskReference {
        TaskReference::new(path, func, Some(format!("mod_{func}")))
    }

    #[tokio::test]
    async fn first_scan_adds_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ManifestManager::new(dir.path().join("manifest.json"));
        let diff = manager.diff_and_save(vec![task("a.py", "add")], Vec::new()).await.unwrap();
        assert_eq!(diff.tasks_added.len(), 1);
        assert!(diff.saved);
    }

    #[tokio::test]
    async fn unchanged_rescan_reports_no_diff_and_does_not_resave() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ManifestManager::new(dir.path().join("manifest.json"));
        manager.diff_and_save(vec![task("a.py", "add")], Vec::new()).await.unwrap();
        let diff = manager.diff_and_save(vec![task("a.py", "add")], Vec::new()).await.unwrap();
        assert!(diff.is_empty());
        assert!(!diff.saved);
    }

    #[tokio::test]
    async fn moved_task_is_reported_as_modified_not_added_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ManifestManager::new(dir.path().join("manifest.json"));
        manager.diff_and_save(vec![task("a.py", "add")], Vec::new()).await.unwrap();
        let diff = manager.diff_and_save(vec![task("b.py", "add")], Vec::new()).await.unwrap();
        assert_eq!(diff.tasks_modified.len(), 1);
        assert!(diff.tasks_added.is_empty());
        assert!(diff.tasks_removed.is_empty());
    }

    #[tokio::test]
    async fn removed_task_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ManifestManager::new(dir.path().join("manifest.json"));
        manager.diff_and_save(vec![task("a.py", "add"), task("a.py", "sub")], Vec::new()).await.unwrap();
        let diff = manager.diff_and_save(vec![task("a.py", "add")], Vec::new()).await.unwrap();
        assert_eq!(diff.tasks_removed.len(), 1);
        assert_eq!(diff.tasks_removed[0].func_name, "sub");
    }
}
