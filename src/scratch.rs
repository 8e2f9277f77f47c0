use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

/// Root for short-lived per-job directories and cookie files.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root if needed; losing a creation race to another job is fine.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn create_job_dir(&self, job_id: Uuid) -> io::Result<PathBuf> {
        let job_dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&job_dir).await?;
        Ok(job_dir)
    }

    pub fn unique_cookie_path(&self) -> PathBuf {
        self.root
            .join(format!("cookies_{}.txt", Uuid::new_v4().simple()))
    }

    /// Deletes job dirs and cookie files older than `older_than`, e.g.
    /// leftovers of a crash. Entries this service did not name are kept.
    pub async fn sweep_stale(&self, older_than: Duration) -> usize {
        if older_than.is_zero() {
            return 0;
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("could not open scratch dir for sweeping: {error}");
                }
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!("could not iterate scratch dir: {error}");
                    break;
                }
            };

            let path = entry.path();
            let is_dir = match entry.file_type().await {
                Ok(file_type) => file_type.is_dir(),
                Err(error) => {
                    warn!("could not read type of {:?}: {error}", path);
                    continue;
                }
            };
            if !is_scratch_entry(&entry.file_name().to_string_lossy(), is_dir) {
                debug!("leaving foreign scratch entry {:?}", path);
                continue;
            }

            let modified_at = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(value) => value,
                Err(error) => {
                    warn!("could not read age of {:?}: {error}", path);
                    continue;
                }
            };

            let age = now.duration_since(modified_at).unwrap_or_default();
            if age < older_than {
                continue;
            }

            let removal = tokio::task::spawn_blocking(move || remove_path_quietly(&path));
            if removal.await.unwrap_or(false) {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("swept {removed} stale scratch entries from {:?}", self.root);
        }
        removed
    }
}

/// Names produced by `create_job_dir` and `unique_cookie_path`.
fn is_scratch_entry(name: &str, is_dir: bool) -> bool {
    if is_dir {
        return Uuid::try_parse(name).is_ok_and(|id| id.hyphenated().to_string() == name);
    }

    name.strip_prefix("cookies_")
        .and_then(|rest| rest.strip_suffix(".txt"))
        .is_some_and(|raw| Uuid::try_parse(raw).is_ok_and(|id| id.simple().to_string() == raw))
}

/// Removes `path` on the blocking pool when a runtime is running, inline
/// otherwise. Used from `Drop`, where nothing can be awaited.
pub fn discard_path(path: PathBuf) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || remove_path_quietly(&path));
        }
        Err(_) => {
            remove_path_quietly(&path);
        }
    }
}

/// Removes a file or directory tree, treating "already gone" as success.
fn remove_path_quietly(path: &Path) -> bool {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => {
            debug!("removed {:?}", path);
            true
        }
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => {
            warn!("could not remove {:?}: {error}", path);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{entry_count, settled_entry_count};

    #[tokio::test]
    async fn ensure_is_idempotent_under_concurrent_first_use() {
        let dir = TempDir::new().expect("temp dir");
        let scratch = ScratchDir::new(dir.path().join("nested").join("scratch"));

        let attempts = (0..8).map(|_| {
            let scratch = scratch.clone();
            tokio::spawn(async move { scratch.ensure().await })
        });
        for attempt in attempts {
            attempt.await.expect("task").expect("create_dir_all");
        }

        assert!(scratch.root().is_dir());
        scratch.ensure().await.expect("second ensure");
    }

    #[tokio::test]
    async fn job_dirs_and_cookie_paths_are_unique() {
        let dir = TempDir::new().expect("temp dir");
        let scratch = ScratchDir::new(dir.path());

        let first = scratch.create_job_dir(Uuid::new_v4()).await.expect("job dir");
        let second = scratch.create_job_dir(Uuid::new_v4()).await.expect("job dir");
        assert_ne!(first, second);
        assert_ne!(scratch.unique_cookie_path(), scratch.unique_cookie_path());
    }

    #[tokio::test]
    async fn sweep_removes_old_entries_only_when_enabled() {
        let dir = TempDir::new().expect("temp dir");
        let scratch = ScratchDir::new(dir.path());
        scratch.create_job_dir(Uuid::new_v4()).await.expect("job dir");
        std::fs::write(scratch.unique_cookie_path(), "x").expect("write");

        assert_eq!(scratch.sweep_stale(Duration::ZERO).await, 0);
        assert_eq!(scratch.sweep_stale(Duration::from_secs(3600)).await, 0);
        assert_eq!(entry_count(dir.path()), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scratch.sweep_stale(Duration::from_millis(1)).await, 2);
        assert_eq!(entry_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn sweep_leaves_foreign_entries_alone() {
        let dir = TempDir::new().expect("temp dir");
        let scratch = ScratchDir::new(dir.path());
        let notes = dir.path().join("operator-notes.txt");
        let project = dir.path().join("unrelated-project");
        std::fs::write(&notes, "keep me").expect("write");
        std::fs::create_dir(&project).expect("mkdir");
        std::fs::write(dir.path().join("cookies_backup.txt"), "x").expect("write");
        std::fs::write(dir.path().join(Uuid::new_v4().to_string()), "x").expect("write");
        scratch.create_job_dir(Uuid::new_v4()).await.expect("job dir");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scratch.sweep_stale(Duration::from_millis(1)).await, 1);
        assert!(notes.is_file());
        assert!(project.is_dir());
        assert_eq!(entry_count(dir.path()), 4);
    }

    #[test]
    fn recognizes_own_entry_names() {
        let id = Uuid::new_v4();
        assert!(is_scratch_entry(&id.to_string(), true));
        assert!(is_scratch_entry(&format!("cookies_{}.txt", id.simple()), false));
        assert!(!is_scratch_entry(&id.to_string(), false));
        assert!(!is_scratch_entry(&format!("cookies_{}.txt", id.simple()), true));
        assert!(!is_scratch_entry(&format!("cookies_{id}.txt"), false));
        assert!(!is_scratch_entry("tmp", true));
        assert!(!is_scratch_entry("cookies_.txt", false));
    }

    #[tokio::test]
    async fn discarding_inside_a_runtime_completes_off_thread() {
        let dir = TempDir::new().expect("temp dir");
        let job_dir = dir.path().join("job");
        std::fs::create_dir_all(job_dir.join("nested")).expect("mkdir");
        std::fs::write(job_dir.join("nested").join("video.part"), "x").expect("write");

        discard_path(job_dir);
        assert_eq!(settled_entry_count(dir.path()).await, 0);
    }

    #[test]
    fn discarding_without_a_runtime_is_immediate() {
        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("cookies.txt");
        std::fs::write(&file, "x").expect("write");

        discard_path(file.clone());
        assert!(!file.exists());
    }

    #[test]
    fn removing_a_missing_path_is_not_an_error() {
        let dir = TempDir::new().expect("temp dir");
        assert!(!remove_path_quietly(&dir.path().join("gone")));
    }
}
