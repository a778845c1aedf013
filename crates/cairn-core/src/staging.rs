//! Staged, all-or-nothing writes into the working tree.
//!
//! New file contents are first written under a private staging directory
//! next to the repository metadata. Only once every file is staged are the
//! targets swapped in with renames. Displaced originals are parked in a
//! backup directory so any failure during the swap can be rolled back.

use crate::{CairnError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory (inside the git dir) holding in-flight staging areas.
pub const STAGING_DIR: &str = "cairn-staging";

/// Kind of file being materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular { executable: bool },
    Symlink,
}

#[derive(Debug)]
struct PendingWrite {
    rel: PathBuf,
    staged: PathBuf,
}

#[derive(Debug)]
struct Swap {
    target: PathBuf,
    backup: Option<PathBuf>,
    /// Whether a new file was renamed into `target`.
    placed: bool,
    created_dirs: Vec<PathBuf>,
}

/// A set of writes and removals applied to a working tree as one unit.
#[derive(Debug)]
pub struct StagedWrites {
    root: PathBuf,
    workdir: PathBuf,
    writes: Vec<PendingWrite>,
    removals: Vec<PathBuf>,
    next_slot: usize,
}

impl StagedWrites {
    /// Create a fresh staging area under `<git_dir>/cairn-staging/<uuid>`.
    pub fn new(git_dir: &Path, workdir: &Path) -> Result<Self> {
        let root = git_dir.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        fs::create_dir_all(root.join("new"))
            .and_then(|_| fs::create_dir_all(root.join("backup")))
            .map_err(|e| {
                CairnError::WriteFailed(format!("creating staging area {}: {e}", root.display()))
            })?;
        Ok(Self {
            root,
            workdir: workdir.to_path_buf(),
            writes: Vec::new(),
            removals: Vec::new(),
            next_slot: 0,
        })
    }

    fn slot(&mut self, area: &str) -> PathBuf {
        self.next_slot += 1;
        self.root.join(area).join(self.next_slot.to_string())
    }

    /// Stage the new content of `rel`. Nothing in the working tree changes.
    pub fn stage_file(&mut self, rel: &Path, content: &[u8], kind: FileKind) -> Result<()> {
        let staged = self.slot("new");
        write_staged(&staged, content, kind).map_err(|e| {
            CairnError::WriteFailed(format!("staging {}: {e}", rel.display()))
        })?;
        self.writes.push(PendingWrite {
            rel: rel.to_path_buf(),
            staged,
        });
        Ok(())
    }

    /// Schedule removal of `rel` from the working tree.
    pub fn stage_removal(&mut self, rel: &Path) {
        self.removals.push(rel.to_path_buf());
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.removals.is_empty()
    }

    /// Swap every staged change into place, or none of them.
    ///
    /// Returns the written and removed relative paths. On failure every
    /// completed swap is undone before the error is returned.
    pub fn commit(mut self) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let writes = std::mem::take(&mut self.writes);
        let removals = std::mem::take(&mut self.removals);
        let mut done: Vec<Swap> = Vec::with_capacity(writes.len() + removals.len());

        let outcome = self.swap_all(&writes, &removals, &mut done);
        let result = match outcome {
            Ok(()) => Ok((
                writes.into_iter().map(|w| w.rel).collect(),
                removals,
            )),
            Err(e) => {
                warn!(target: "cairn::restore", "Materialization failed, rolling back {} changes: {}", done.len(), e);
                let failures = rollback(done);
                if failures.is_empty() {
                    Err(CairnError::WriteFailed(e.to_string()))
                } else {
                    Err(CairnError::RollbackIncomplete(format!(
                        "{e}; could not restore {}",
                        failures.join(", ")
                    )))
                }
            }
        };

        self.cleanup();
        result
    }

    fn swap_all(
        &mut self,
        writes: &[PendingWrite],
        removals: &[PathBuf],
        done: &mut Vec<Swap>,
    ) -> io::Result<()> {
        for write in writes {
            let target = self.workdir.join(&write.rel);
            let created_dirs = match target.parent() {
                Some(parent) => create_parents(parent)?,
                None => Vec::new(),
            };
            let backup = if target.symlink_metadata().is_ok() {
                let slot = self.slot("backup");
                if let Err(e) = fs::rename(&target, &slot) {
                    remove_created(&created_dirs);
                    return Err(e);
                }
                Some(slot)
            } else {
                None
            };
            let mut swap = Swap {
                target: target.clone(),
                backup,
                placed: false,
                created_dirs,
            };
            let placed = fs::rename(&write.staged, &target);
            swap.placed = placed.is_ok();
            done.push(swap);
            placed?;
        }

        for rel in removals {
            let target = self.workdir.join(rel);
            let slot = self.slot("backup");
            fs::rename(&target, &slot)?;
            done.push(Swap {
                target,
                backup: Some(slot),
                placed: false,
                created_dirs: Vec::new(),
            });
        }

        Ok(())
    }

    fn cleanup(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(target: "cairn::restore", "Failed to remove staging area {}: {}", self.root.display(), e);
        }
    }
}

impl Drop for StagedWrites {
    fn drop(&mut self) {
        // Uncommitted staging areas (early returns while planning) hold no
        // working-tree data, only staged copies.
        if self.root.exists() {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

fn write_staged(path: &Path, content: &[u8], kind: FileKind) -> io::Result<()> {
    match kind {
        FileKind::Regular { executable } => {
            fs::write(path, content)?;
            set_executable(path, executable)
        }
        FileKind::Symlink => write_symlink(path, content),
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(path: &Path, target: &[u8]) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(target), path)
}

#[cfg(not(unix))]
fn write_symlink(path: &Path, target: &[u8]) -> io::Result<()> {
    // Same fallback git uses without symlink support: a file holding the target.
    fs::write(path, target)
}

/// Create the missing ancestors of a target, returning them deepest-first.
fn create_parents(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(d) = cursor {
        if d.exists() {
            break;
        }
        missing.push(d.to_path_buf());
        cursor = d.parent();
    }
    fs::create_dir_all(dir)?;
    Ok(missing)
}

fn remove_created(dirs: &[PathBuf]) {
    for dir in dirs {
        let _ = fs::remove_dir(dir);
    }
}

/// Undo swaps in reverse order. Returns the targets that could not be restored.
fn rollback(done: Vec<Swap>) -> Vec<String> {
    let mut failures = Vec::new();
    for swap in done.into_iter().rev() {
        if swap.placed {
            if let Err(e) = fs::remove_file(&swap.target) {
                failures.push(format!("{} ({e})", swap.target.display()));
                continue;
            }
        }
        if let Some(backup) = &swap.backup {
            if let Err(e) = fs::rename(backup, &swap.target) {
                failures.push(format!("{} ({e})", swap.target.display()));
                continue;
            }
        }
        remove_created(&swap.created_dirs);
        debug!(target: "cairn::restore", "Rolled back {}", swap.target.display());
    }
    failures
}
