//! Profile directory management for the master session and per-job clones
//!
//! The master profile is the long-lived authenticated browser state; every
//! job gets a disposable copy of it under the clone root. Clone directories
//! are single-owner and removed when the owning job finishes, whatever the
//! outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::ProfileError;

/// Chrome's default profile subdirectory inside a user-data dir
const PROFILE_SUBDIR: &str = "Default";

/// Layout descriptor of a freshly cloned profile
#[derive(Debug, Clone)]
pub struct CloneLayout {
    /// Directory to hand to the browser as `--user-data-dir`
    pub user_data_dir: PathBuf,
    /// Profile subdirectory name within the user-data dir
    pub profile_subdir: String,
    /// `user_data_dir` joined with `profile_subdir`
    pub full_path: PathBuf,
}

// =============================================================================
// ProfileStore
// =============================================================================

/// Manages the clone root and the copy/delete/backup/restore operations on
/// profile directories.
pub struct ProfileStore {
    clone_root: PathBuf,
    /// Files at or above this size are treated as caches and skipped
    skip_file_size: u64,
    /// Monotonic component embedded in clone ids
    clone_seq: AtomicU64,
}

impl ProfileStore {
    /// Create a store rooted at `clone_root`, creating the directory if needed.
    pub fn new(clone_root: impl Into<PathBuf>, skip_file_size: u64) -> Result<Self, ProfileError> {
        let clone_root = clone_root.into();
        std::fs::create_dir_all(&clone_root)
            .map_err(|e| ProfileError::io(&clone_root, e))?;
        Ok(Self {
            clone_root,
            skip_file_size,
            clone_seq: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn clone_root(&self) -> &Path {
        &self.clone_root
    }

    /// Copy the master profile into a fresh clone directory for `job_id`.
    ///
    /// The copy is best-effort: lock files (any name containing `lock`,
    /// case-insensitive) and oversized cache files are skipped, and an
    /// unreadable entry is logged and passed over rather than failing the
    /// clone. Chrome may be writing to the master concurrently; the
    /// post-navigation validator catches any resulting inconsistency.
    pub fn clone_profile(
        &self,
        master_dir: &Path,
        job_id: &str,
    ) -> Result<CloneLayout, ProfileError> {
        let seq = self.clone_seq.fetch_add(1, Ordering::Relaxed);
        let clone_id = format!("clone_{job_id}_{seq}");
        let dest = self.clone_root.join(&clone_id);

        std::fs::create_dir(&dest).map_err(|e| ProfileError::io(&dest, e))?;
        debug!("Cloning profile {} -> {}", master_dir.display(), dest.display());

        let mut copied = 0usize;
        let mut skipped = 0usize;
        copy_tree(
            master_dir,
            &dest,
            self.skip_file_size,
            &mut copied,
            &mut skipped,
        )?;

        info!(
            "Cloned profile for job {job_id}: {copied} files copied, {skipped} skipped ({})",
            dest.display()
        );

        Ok(CloneLayout {
            full_path: dest.join(PROFILE_SUBDIR),
            user_data_dir: dest,
            profile_subdir: PROFILE_SUBDIR.to_string(),
        })
    }

    /// Recursively delete a profile directory. Idempotent: a directory that
    /// is already gone is not an error.
    pub fn delete(&self, dir: &Path) -> Result<(), ProfileError> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProfileError::io(dir, e)),
        }
    }

    /// Move `dir` aside to a timestamped sibling and return the backup path.
    pub fn backup(&self, dir: &Path) -> Result<PathBuf, ProfileError> {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "profile".to_string());
        let backup = dir.with_file_name(format!("{name}.bak-{stamp}"));

        std::fs::rename(dir, &backup).map_err(|e| ProfileError::io(dir, e))?;
        info!("Backed up {} -> {}", dir.display(), backup.display());
        Ok(backup)
    }

    /// Put a backup produced by [`backup`](Self::backup) back in place,
    /// replacing whatever currently occupies `dir`.
    pub fn restore(&self, backup: &Path, dir: &Path) -> Result<(), ProfileError> {
        if !backup.exists() {
            return Err(ProfileError::MissingBackup(backup.to_path_buf()));
        }
        self.delete(dir)?;
        std::fs::rename(backup, dir).map_err(|e| ProfileError::io(backup, e))?;
        info!("Restored {} -> {}", backup.display(), dir.display());
        Ok(())
    }

    /// Remove clone directories left behind by a previous process crash.
    ///
    /// Safe at startup only: no jobs are running, so every `clone_*` entry
    /// under the root is orphaned.
    pub fn sweep_stale_clones(&self) -> Result<usize, ProfileError> {
        let entries = std::fs::read_dir(&self.clone_root)
            .map_err(|e| ProfileError::io(&self.clone_root, e))?;

        let mut cleaned = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_clone = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("clone_"));
            if is_clone && path.is_dir() {
                info!("Sweeping stale clone: {}", path.display());
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!("Failed to sweep stale clone {}: {e}", path.display());
                } else {
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            info!("Swept {cleaned} stale clone directories");
        }
        Ok(cleaned)
    }
}

/// Recursive copy: directories first, then files, skipping lock and cache
/// entries. Unreadable entries are logged and skipped.
fn copy_tree(
    src: &Path,
    dest: &Path,
    skip_file_size: u64,
    copied: &mut usize,
    skipped: &mut usize,
) -> Result<(), ProfileError> {
    let entries = match std::fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Skipping unreadable directory {}: {e}", src.display());
            *skipped += 1;
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let from = entry.path();
        let name = entry.file_name();
        let to = dest.join(&name);

        let is_lock = name
            .to_str()
            .is_some_and(|n| n.to_ascii_lowercase().contains("lock"));
        if is_lock {
            debug!("Skipping lock file {}", from.display());
            *skipped += 1;
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!("Skipping unreadable entry {}: {e}", from.display());
                *skipped += 1;
                continue;
            }
        };

        if file_type.is_dir() {
            std::fs::create_dir_all(&to).map_err(|e| ProfileError::io(&to, e))?;
            copy_tree(&from, &to, skip_file_size, copied, skipped)?;
        } else if file_type.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= skip_file_size {
                debug!("Skipping cache file {} ({size} bytes)", from.display());
                *skipped += 1;
                continue;
            }
            match std::fs::copy(&from, &to) {
                Ok(_) => *copied += 1,
                Err(e) => {
                    // Chrome holds some files open exclusively while running
                    warn!("Skipping locked or unreadable file {}: {e}", from.display());
                    *skipped += 1;
                }
            }
        }
        // Symlinks (SingletonLock and friends) are dropped with the lock rule
    }

    Ok(())
}

// =============================================================================
// CloneLease
// =============================================================================

/// Single-owner lease on a clone directory.
///
/// The owning job calls [`release`](Self::release) on its normal exit paths;
/// the `Drop` fallback covers cancellation and panics so no clone directory
/// outlives its job.
pub struct CloneLease {
    layout: CloneLayout,
    released: bool,
}

impl CloneLease {
    #[must_use]
    pub fn new(layout: CloneLayout) -> Self {
        Self {
            layout,
            released: false,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &CloneLayout {
        &self.layout
    }

    #[must_use]
    pub fn user_data_dir(&self) -> &Path {
        &self.layout.user_data_dir
    }

    /// Delete the clone directory now.
    pub fn release(mut self) {
        self.released = true;
        remove_clone_dir(&self.layout.user_data_dir);
    }
}

impl Drop for CloneLease {
    fn drop(&mut self) {
        if !self.released {
            remove_clone_dir(&self.layout.user_data_dir);
        }
    }
}

fn remove_clone_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed clone directory {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove clone directory {}: {e}", path.display()),
    }
}
