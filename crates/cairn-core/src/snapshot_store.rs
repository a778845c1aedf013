//! Snapshot storage on top of git.
//!
//! A snapshot is a commit whose tree is the full working-tree state (index
//! overlaid with unstaged edits, deletions and non-ignored untracked files)
//! and whose parent is `HEAD`. Each snapshot is bound to a ref under
//! `refs/cairn/<session>/`, a namespace that branch and tag listings never
//! show and that can be deleted by prefix.

use crate::staging::{FileKind, StagedWrites};
use crate::{CairnError, Result};
use cairn_types::{
    AppliedResult, CheckpointRole, CreatedFile, NodeId, RefToken, SessionId, Snapshot,
};
use chrono::{DateTime, TimeZone, Utc};
use git2::{
    Commit, ErrorCode, Index, IndexEntry, IndexTime, ObjectType, Oid, Repository, Signature,
    Status, StatusOptions, Tree,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Root of the snapshot ref namespace.
pub const REF_NAMESPACE: &str = "refs/cairn";

/// Untracked files above this size are left out of snapshots (10 MiB).
pub const DEFAULT_MAX_UNTRACKED_BYTES: u64 = 10 * 1024 * 1024;

const FILEMODE_BLOB: i32 = 0o100644;
const FILEMODE_BLOB_EXECUTABLE: i32 = 0o100755;
const FILEMODE_LINK: i32 = 0o120000;

/// What a new snapshot is for. The store derives the ref name from it.
#[derive(Debug, Clone)]
pub struct SnapshotLabel<'a> {
    pub role: CheckpointRole,
    pub sequence: u64,
    pub node_id: &'a NodeId,
    pub created_at: DateTime<Utc>,
}

/// How a snapshot is materialized into the working tree.
///
/// Regardless of policy the index is never rewritten (staged changes
/// survive). Untracked files are only deleted when an earlier restore
/// created them and they still hold the content it wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Remove files tracked in the current index that the snapshot lacks.
    pub remove_tracked_absent: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            remove_tracked_absent: true,
        }
    }
}

/// A snapshot found in the namespace, with the metadata recorded at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub snapshot: Snapshot,
    pub role: CheckpointRole,
    pub sequence: u64,
    /// Bound node, read back from the commit trailers.
    pub node_id: Option<NodeId>,
}

/// Storage backend for working-tree snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Capture the current working tree and bind it to a fresh ref.
    fn create(&self, label: &SnapshotLabel<'_>) -> Result<Snapshot>;

    /// Remove a ref. Removing a missing ref is not an error.
    fn delete(&self, ref_name: &str) -> Result<()>;

    /// Materialize a snapshot into the working tree. `created_earlier` lists
    /// files previous restores created; those the snapshot lacks are removed
    /// if still unchanged.
    fn apply(
        &self,
        ref_name: &str,
        policy: &MergePolicy,
        created_earlier: &[CreatedFile],
    ) -> Result<AppliedResult>;

    /// Snapshots whose ref name starts with `prefix`, in sequence order.
    fn list(&self, prefix: &str) -> Result<Vec<SnapshotRecord>>;

    /// Whether the working tree differs from `snapshot`.
    fn has_changes_since(&self, snapshot: &Snapshot) -> Result<bool>;
}

/// Git-backed snapshot store scoped to one session's ref namespace.
#[derive(Debug, Clone)]
pub struct GitSnapshotStore {
    workdir: PathBuf,
    session_id: SessionId,
    max_untracked_bytes: u64,
}

impl GitSnapshotStore {
    pub fn new(workdir: impl Into<PathBuf>, session_id: SessionId) -> Self {
        Self {
            workdir: workdir.into(),
            session_id,
            max_untracked_bytes: DEFAULT_MAX_UNTRACKED_BYTES,
        }
    }

    pub fn with_max_untracked_bytes(mut self, bytes: u64) -> Self {
        self.max_untracked_bytes = bytes;
        self
    }

    /// `refs/cairn/<session>`
    pub fn namespace(&self) -> String {
        format!("{}/{}", REF_NAMESPACE, self.session_id)
    }

    fn full_ref(&self, ref_name: &str) -> String {
        format!("{}/{}", self.namespace(), ref_name)
    }

    fn open_repo(&self) -> Result<Repository> {
        let repo = Repository::open(&self.workdir).map_err(|e| {
            CairnError::BackendUnavailable(format!(
                "{} is not a git repository: {}",
                self.workdir.display(),
                e.message()
            ))
        })?;
        if repo.is_bare() {
            return Err(CairnError::BackendUnavailable(format!(
                "{} is a bare repository",
                self.workdir.display()
            )));
        }
        Ok(repo)
    }

    fn head_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        let head = repo.head().map_err(|e| match e.code() {
            ErrorCode::UnbornBranch | ErrorCode::NotFound => CairnError::BackendUnavailable(
                format!("{} has no commits yet", self.workdir.display()),
            ),
            _ => CairnError::GitError(e),
        })?;
        Ok(head.peel_to_commit()?)
    }

    /// Write the current working-tree state as a tree object.
    fn capture_tree(&self, repo: &Repository) -> Result<Oid> {
        let repo_index = repo.index()?;
        let mut index = Index::new()?;
        for entry in repo_index.iter() {
            // Conflict stages are replaced by the working-tree file below.
            if index_stage(&entry) == 0 {
                index.add(&entry)?;
            }
        }

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = repo.statuses(Some(&mut opts))?;

        for entry in statuses.iter() {
            let rel = entry.path_bytes();
            let status = entry.status();
            if status.contains(Status::WT_DELETED) {
                remove_from_index(&mut index, &path_from_bytes(rel))?;
                continue;
            }
            let untracked = status.contains(Status::WT_NEW);
            if status.intersects(
                Status::WT_NEW | Status::WT_MODIFIED | Status::WT_TYPECHANGE | Status::CONFLICTED,
            ) {
                self.add_worktree_file(repo, &mut index, rel, untracked)?;
            }
        }

        Ok(index.write_tree_to(repo)?)
    }

    fn add_worktree_file(
        &self,
        repo: &Repository,
        index: &mut Index,
        rel: &[u8],
        untracked: bool,
    ) -> Result<()> {
        let path = path_from_bytes(rel);
        let abs = self.workdir.join(&path);
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Vanished between status and read.
                remove_from_index(index, &path)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let (oid, mode, size) = if meta.file_type().is_symlink() {
            let target = fs::read_link(&abs)?;
            let bytes = target.to_string_lossy().into_owned().into_bytes();
            (repo.blob(&bytes)?, FILEMODE_LINK, bytes.len() as u64)
        } else if meta.is_file() {
            if untracked && meta.len() > self.max_untracked_bytes {
                debug!(target: "cairn::store",
                    "Skipping large untracked file {} ({} bytes)", path.display(), meta.len());
                return Ok(());
            }
            let content = fs::read(&abs)?;
            let mode = if is_executable(&meta) {
                FILEMODE_BLOB_EXECUTABLE
            } else {
                FILEMODE_BLOB
            };
            (repo.blob(&content)?, mode, content.len() as u64)
        } else {
            return Ok(());
        };

        index.add(&IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: mode as u32,
            uid: 0,
            gid: 0,
            file_size: size as u32,
            id: oid,
            flags: 0,
            flags_extended: 0,
            path: rel.to_vec(),
        })?;
        Ok(())
    }

    fn commit_message(&self, label: &SnapshotLabel<'_>) -> String {
        format!(
            "cairn {} checkpoint {}\n\nCairn-Session: {}\nCairn-Node: {}\nCairn-Role: {}\nCairn-Sequence: {}\n",
            label.role,
            label.sequence,
            self.session_id,
            label.node_id.as_str().replace(['\n', '\r'], " "),
            label.role,
            label.sequence,
        )
    }

    fn record_from_ref(&self, reference: &git2::Reference<'_>) -> Result<Option<SnapshotRecord>> {
        let Some(name) = reference.name() else {
            return Ok(None);
        };
        let prefix = format!("{}/", self.namespace());
        let Some(short) = name.strip_prefix(&prefix) else {
            return Ok(None);
        };
        let Some(token) = RefToken::parse(short) else {
            warn!(target: "cairn::store", "Ignoring unrecognized ref {}", name);
            return Ok(None);
        };
        let commit = reference.peel_to_commit()?;
        let created_at = Utc
            .timestamp_millis_opt(token.created_millis)
            .single()
            .unwrap_or_else(|| commit_time(&commit));
        let node_id = commit
            .message()
            .and_then(|msg| trailer(msg, "Cairn-Node"))
            .map(NodeId::new);

        Ok(Some(SnapshotRecord {
            snapshot: Snapshot {
                ref_name: short.to_string(),
                object_id: commit.id().to_string(),
                created_at,
            },
            role: token.role,
            sequence: token.sequence,
            node_id,
        }))
    }
}

impl SnapshotStore for GitSnapshotStore {
    fn create(&self, label: &SnapshotLabel<'_>) -> Result<Snapshot> {
        let repo = self.open_repo()?;
        let parent = self.head_commit(&repo)?;

        let tree_id = self.capture_tree(&repo).map_err(|e| match e {
            CairnError::BackendUnavailable(_) => e,
            other => CairnError::WriteFailed(format!("capturing working tree: {other}")),
        })?;
        let tree = repo.find_tree(tree_id)?;

        let signature = Signature::now("cairn", "cairn@localhost")?;
        let ref_name = label.role.ref_name(label.sequence, label.created_at);
        let message = self.commit_message(label);

        let oid = repo
            .commit(None, &signature, &signature, &message, &tree, &[&parent])
            .and_then(|oid| {
                repo.reference(&self.full_ref(&ref_name), oid, false, "cairn: checkpoint")
                    .map(|_| oid)
            })
            .map_err(|e| CairnError::WriteFailed(format!("writing {ref_name}: {e}")))?;

        info!(target: "cairn::store",
            "Created snapshot {} ({}) for node {}", ref_name, oid, label.node_id);

        Ok(Snapshot {
            ref_name,
            object_id: oid.to_string(),
            created_at: label.created_at,
        })
    }

    fn delete(&self, ref_name: &str) -> Result<()> {
        let repo = self.open_repo()?;
        match repo.find_reference(&self.full_ref(ref_name)) {
            Ok(mut reference) => {
                reference.delete()?;
                debug!(target: "cairn::store", "Deleted snapshot ref {}", ref_name);
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(target: "cairn::store", "Snapshot ref {} already absent", ref_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply(
        &self,
        ref_name: &str,
        policy: &MergePolicy,
        created_earlier: &[CreatedFile],
    ) -> Result<AppliedResult> {
        let repo = self.open_repo()?;
        let reference = repo
            .find_reference(&self.full_ref(ref_name))
            .map_err(|e| match e.code() {
                ErrorCode::NotFound | ErrorCode::InvalidSpec => {
                    CairnError::SnapshotNotFound(ref_name.to_string())
                }
                _ => CairnError::GitError(e),
            })?;
        let tree = reference.peel_to_commit()?.tree()?;

        let mut desired: BTreeMap<PathBuf, (Oid, i32)> = BTreeMap::new();
        collect_blobs(&repo, &tree, Path::new(""), &mut desired)?;

        let index = repo.index()?;
        let tracked: BTreeSet<PathBuf> = index
            .iter()
            .filter(|e| index_stage(e) == 0)
            .map(|e| path_from_bytes(&e.path))
            .collect();
        let staged_preserved = staged_paths(&repo, &index)?;

        // Earlier restores' files that still hold the blob they were given.
        let mut ours: BTreeMap<&Path, Oid> = BTreeMap::new();
        for file in created_earlier {
            let Ok(oid) = Oid::from_str(&file.object_id) else {
                continue;
            };
            if disk_blob_id(&self.workdir.join(&file.path))? == Some(oid) {
                ours.insert(file.path.as_path(), oid);
            }
        }

        let git_dir = repo.path().to_path_buf();
        let mut staged = StagedWrites::new(&git_dir, &self.workdir)?;
        let mut created = Vec::new();

        for (rel, (oid, mode)) in &desired {
            let abs = self.workdir.join(rel);
            if matches_on_disk(&abs, *oid, *mode)? {
                continue;
            }
            let blob = repo.find_blob(*oid)?;
            let kind = if *mode == FILEMODE_LINK {
                FileKind::Symlink
            } else {
                FileKind::Regular {
                    executable: *mode == FILEMODE_BLOB_EXECUTABLE,
                }
            };
            let fresh = fs::symlink_metadata(&abs).is_err();
            staged.stage_file(rel, blob.content(), kind)?;
            if fresh || ours.contains_key(rel.as_path()) {
                created.push(CreatedFile {
                    path: rel.clone(),
                    object_id: oid.to_string(),
                });
            }
        }

        if policy.remove_tracked_absent {
            let staged_set: BTreeSet<&PathBuf> = staged_preserved.iter().collect();
            // Paths with staged changes stay on disk alongside their index entry.
            for rel in tracked
                .iter()
                .filter(|p| !desired.contains_key(*p) && !staged_set.contains(p))
            {
                match fs::symlink_metadata(self.workdir.join(rel)) {
                    Ok(meta) if !meta.is_dir() => staged.stage_removal(rel),
                    _ => {}
                }
            }
        }

        let reclaimed: BTreeSet<PathBuf> = ours
            .keys()
            .copied()
            .filter(|p| !desired.contains_key(*p) && !tracked.contains(*p))
            .map(Path::to_path_buf)
            .collect();
        for rel in &reclaimed {
            debug!(target: "cairn::store", "Reclaiming restored file {}", rel.display());
            staged.stage_removal(rel);
        }

        let untracked_kept = untracked_paths(&repo)?
            .into_iter()
            .filter(|p| !desired.contains_key(p) && !reclaimed.contains(p))
            .collect();

        let (written, removed) = if staged.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            staged.commit()?
        };

        info!(target: "cairn::store",
            "Applied snapshot {}: {} written, {} removed, {} staged paths kept",
            ref_name, written.len(), removed.len(), staged_preserved.len());

        Ok(AppliedResult {
            ref_name: ref_name.to_string(),
            written,
            removed,
            staged_preserved,
            untracked_kept,
            created,
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<SnapshotRecord>> {
        let repo = self.open_repo()?;
        let glob = format!("{}/{}*", self.namespace(), prefix);
        let mut records = Vec::new();
        for reference in repo.references_glob(&glob)? {
            if let Some(record) = self.record_from_ref(&reference?)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    fn has_changes_since(&self, snapshot: &Snapshot) -> Result<bool> {
        let repo = self.open_repo()?;
        let oid = Oid::from_str(&snapshot.object_id)
            .map_err(|_| CairnError::SnapshotNotFound(snapshot.ref_name.clone()))?;
        let commit = repo.find_commit(oid).map_err(|e| match e.code() {
            ErrorCode::NotFound => CairnError::SnapshotNotFound(snapshot.ref_name.clone()),
            _ => CairnError::GitError(e),
        })?;
        let current = self.capture_tree(&repo)?;
        Ok(current != commit.tree_id())
    }
}

fn remove_from_index(index: &mut Index, path: &Path) -> Result<()> {
    match index.remove(path, 0) {
        Ok(()) => Ok(()),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn index_stage(entry: &IndexEntry) -> u16 {
    (entry.flags >> 12) & 0x3
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Whether the file at `abs` already has the snapshot's content and mode.
fn matches_on_disk(abs: &Path, oid: Oid, mode: i32) -> Result<bool> {
    let meta = match fs::symlink_metadata(abs) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(CairnError::WriteFailed(format!("{}: {e}", abs.display())));
        }
    };
    if meta.is_dir() {
        return Err(CairnError::WriteFailed(format!(
            "{} is a directory in the working tree but a file in the snapshot",
            abs.display()
        )));
    }
    if mode == FILEMODE_LINK {
        if !meta.file_type().is_symlink() {
            return Ok(false);
        }
        let target = fs::read_link(abs)?;
        let bytes = target.to_string_lossy().into_owned().into_bytes();
        return Ok(Oid::hash_object(ObjectType::Blob, &bytes)? == oid);
    }
    if meta.file_type().is_symlink() {
        return Ok(false);
    }
    let want_exec = mode == FILEMODE_BLOB_EXECUTABLE;
    if cfg!(unix) && is_executable(&meta) != want_exec {
        return Ok(false);
    }
    Ok(Oid::hash_file(ObjectType::Blob, abs)? == oid)
}

/// Paths whose index content differs from `HEAD`.
fn staged_paths(repo: &Repository, index: &Index) -> Result<Vec<PathBuf>> {
    let head_tree = match repo.head() {
        Ok(head) => Some(head.peel_to_tree()?),
        Err(_) => None,
    };
    let diff = repo.diff_tree_to_index(head_tree.as_ref(), Some(index), None)?;
    Ok(diff
        .deltas()
        .filter_map(|d| {
            d.new_file()
                .path()
                .or_else(|| d.old_file().path())
                .map(Path::to_path_buf)
        })
        .collect())
}

fn untracked_paths(repo: &Repository) -> Result<Vec<PathBuf>> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses
        .iter()
        .filter(|e| e.status().contains(Status::WT_NEW))
        .map(|e| path_from_bytes(e.path_bytes()))
        .collect())
}

/// Every blob under `tree`, keyed by working-tree relative path.
fn collect_blobs(
    repo: &Repository,
    tree: &Tree<'_>,
    prefix: &Path,
    out: &mut BTreeMap<PathBuf, (Oid, i32)>,
) -> Result<()> {
    for entry in tree.iter() {
        let rel = prefix.join(path_from_bytes(entry.name_bytes()));
        match entry.kind() {
            Some(ObjectType::Blob) => {
                out.insert(rel, (entry.id(), entry.filemode()));
            }
            Some(ObjectType::Tree) => {
                let subtree = repo.find_tree(entry.id())?;
                collect_blobs(repo, &subtree, &rel, out)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Blob id of the file or symlink at `abs`, `None` when there is none.
fn disk_blob_id(abs: &Path) -> Result<Option<Oid>> {
    let meta = match fs::symlink_metadata(abs) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        let target = fs::read_link(abs)?;
        let bytes = target.to_string_lossy().into_owned().into_bytes();
        Ok(Some(Oid::hash_object(ObjectType::Blob, &bytes)?))
    } else if meta.is_file() {
        Ok(Some(Oid::hash_file(ObjectType::Blob, abs)?))
    } else {
        Ok(None)
    }
}

/// Repository paths are raw bytes; on unix they map to paths losslessly.
#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

fn commit_time(commit: &Commit<'_>) -> DateTime<Utc> {
    Utc.timestamp_opt(commit.time().seconds(), 0)
        .single()
        .unwrap_or_default()
}

fn trailer<'m>(message: &'m str, key: &str) -> Option<&'m str> {
    message.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A repository with one commit containing `tracked.txt`.
    pub fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("tracked.txt"), "base\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("tracked.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        dir
    }

    pub fn stage(dir: &Path, rel: &str) {
        let repo = Repository::open(dir).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel)).unwrap();
        index.write().unwrap();
    }

    pub fn label<'a>(role: CheckpointRole, sequence: u64, node: &'a NodeId) -> SnapshotLabel<'a> {
        SnapshotLabel {
            role,
            sequence,
            node_id: node,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> GitSnapshotStore {
        GitSnapshotStore::new(dir.path(), SessionId::new("s1").unwrap())
    }

    #[test]
    fn test_create_requires_repository() {
        let dir = TempDir::new().unwrap();
        let node = NodeId::from("n1");
        let err = store(&dir)
            .create(&label(CheckpointRole::Resume, 1, &node))
            .unwrap_err();
        assert!(matches!(err, CairnError::BackendUnavailable(_)));
    }

    #[test]
    fn test_create_requires_a_commit() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        let node = NodeId::from("n1");
        let err = store(&dir)
            .create(&label(CheckpointRole::Resume, 1, &node))
            .unwrap_err();
        assert!(matches!(err, CairnError::BackendUnavailable(_)));
    }

    #[test]
    fn test_snapshot_ref_lives_outside_branches() {
        let dir = init_repo();
        let node = NodeId::from("n1");
        let snap = store(&dir)
            .create(&label(CheckpointRole::Resume, 1, &node))
            .unwrap();
        assert!(snap.ref_name.starts_with("checkpoint-resume-000001-"));

        let repo = Repository::open(dir.path()).unwrap();
        let full = format!("refs/cairn/s1/{}", snap.ref_name);
        assert!(repo.find_reference(&full).is_ok());
        let branches: Vec<_> = repo
            .branches(None)
            .unwrap()
            .map(|b| b.unwrap().0.name().unwrap().unwrap().to_string())
            .collect();
        assert!(branches.iter().all(|b| !b.contains("checkpoint")));
        // HEAD did not move.
        assert_eq!(repo.head().unwrap().peel_to_commit().unwrap().message(), Some("initial"));
    }

    #[test]
    fn test_change_detection() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let snap = s.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();
        assert!(!s.has_changes_since(&snap).unwrap());

        fs::write(dir.path().join("tracked.txt"), "edited\n").unwrap();
        assert!(s.has_changes_since(&snap).unwrap());

        fs::write(dir.path().join("tracked.txt"), "base\n").unwrap();
        assert!(!s.has_changes_since(&snap).unwrap());

        fs::write(dir.path().join("new.txt"), "untracked\n").unwrap();
        assert!(s.has_changes_since(&snap).unwrap());
    }

    #[test]
    fn test_ignored_files_do_not_count_as_changes() {
        let dir = init_repo();
        fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let snap = s.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();

        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/out.bin"), "build output").unwrap();
        assert!(!s.has_changes_since(&snap).unwrap());
    }

    #[test]
    fn test_apply_round_trips_tracked_and_new_files() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");

        fs::write(dir.path().join("tracked.txt"), "v1\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn v1() {}\n").unwrap();
        let v1 = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();

        fs::write(dir.path().join("tracked.txt"), "v2\n").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn v2() {}\n").unwrap();

        let applied = s.apply(&v1.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(applied.written.len(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("tracked.txt")).unwrap(), "v1\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
            "pub fn v1() {}\n"
        );
        assert!(!s.has_changes_since(&v1).unwrap());
    }

    #[test]
    fn test_apply_leaves_untracked_files_alone() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let snap = s.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();

        fs::write(dir.path().join("notes.md"), "scratch").unwrap();
        let applied = s.apply(&snap.ref_name, &MergePolicy::default(), &[]).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("notes.md")).unwrap(), "scratch");
        assert_eq!(applied.untracked_kept, vec![PathBuf::from("notes.md")]);
        assert!(applied.is_noop());
    }

    #[test]
    fn test_apply_preserves_staged_changes() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let snap = s.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();

        fs::write(dir.path().join("tracked.txt"), "staged\n").unwrap();
        stage(dir.path(), "tracked.txt");

        let applied = s.apply(&snap.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(applied.staged_preserved, vec![PathBuf::from("tracked.txt")]);
        assert_eq!(fs::read_to_string(dir.path().join("tracked.txt")).unwrap(), "base\n");

        // The index still holds the staged content.
        let repo = Repository::open(dir.path()).unwrap();
        let index = repo.index().unwrap();
        let entry = index.get_path(Path::new("tracked.txt"), 0).unwrap();
        let blob = repo.find_blob(entry.id).unwrap();
        assert_eq!(blob.content(), b"staged\n");
    }

    #[test]
    fn test_apply_removes_tracked_files_absent_from_snapshot() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");

        fs::remove_file(dir.path().join("tracked.txt")).unwrap();
        let without = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();
        fs::write(dir.path().join("tracked.txt"), "back\n").unwrap();

        let keep = MergePolicy {
            remove_tracked_absent: false,
        };
        let applied = s.apply(&without.ref_name, &keep, &[]).unwrap();
        assert!(applied.removed.is_empty());
        assert!(dir.path().join("tracked.txt").exists());

        let applied = s.apply(&without.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(applied.removed, vec![PathBuf::from("tracked.txt")]);
        assert!(!dir.path().join("tracked.txt").exists());
    }

    #[test]
    fn test_apply_reclaims_files_it_created() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");

        fs::write(dir.path().join("scratch.txt"), "scratch\n").unwrap();
        let with = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();
        fs::remove_file(dir.path().join("scratch.txt")).unwrap();
        let without = s.create(&label(CheckpointRole::Assistant, 3, &node)).unwrap();

        let applied = s.apply(&with.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(applied.created.len(), 1);
        assert_eq!(applied.created[0].path, PathBuf::from("scratch.txt"));

        // Without the record the file is an ordinary untracked file.
        let kept = s.apply(&without.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(kept.untracked_kept, vec![PathBuf::from("scratch.txt")]);

        let applied = s
            .apply(&without.ref_name, &MergePolicy::default(), &applied.created)
            .unwrap();
        assert_eq!(applied.removed, vec![PathBuf::from("scratch.txt")]);
        assert!(applied.untracked_kept.is_empty());
        assert!(!dir.path().join("scratch.txt").exists());
        assert!(!s.has_changes_since(&without).unwrap());
    }

    #[test]
    fn test_apply_keeps_created_files_edited_since() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");

        fs::write(dir.path().join("scratch.txt"), "scratch\n").unwrap();
        let with = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();
        fs::remove_file(dir.path().join("scratch.txt")).unwrap();
        let without = s.create(&label(CheckpointRole::Assistant, 3, &node)).unwrap();

        let created = s
            .apply(&with.ref_name, &MergePolicy::default(), &[])
            .unwrap()
            .created;
        fs::write(dir.path().join("scratch.txt"), "my own notes\n").unwrap();

        let applied = s
            .apply(&without.ref_name, &MergePolicy::default(), &created)
            .unwrap();
        assert!(applied.removed.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("scratch.txt")).unwrap(),
            "my own notes\n"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_paths_are_captured_and_restored() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        fs::write(dir.path().join(name), "latin-1\n").unwrap();

        let snap = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();
        assert!(!s.has_changes_since(&snap).unwrap());

        fs::remove_file(dir.path().join(name)).unwrap();
        assert!(s.has_changes_since(&snap).unwrap());

        let applied = s.apply(&snap.ref_name, &MergePolicy::default(), &[]).unwrap();
        assert_eq!(applied.written, vec![PathBuf::from(name)]);
        assert_eq!(fs::read_to_string(dir.path().join(name)).unwrap(), "latin-1\n");
    }

    #[test]
    fn test_apply_unknown_ref() {
        let dir = init_repo();
        let err = store(&dir)
            .apply("checkpoint-000009-1", &MergePolicy::default(), &[])
            .unwrap_err();
        assert!(matches!(err, CairnError::SnapshotNotFound(_)));
    }

    #[test]
    fn test_apply_refuses_directory_in_place_of_file() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        fs::write(dir.path().join("tracked.txt"), "v1\n").unwrap();
        let snap = s.create(&label(CheckpointRole::User, 2, &node)).unwrap();

        fs::write(dir.path().join("other.txt"), "keep me").unwrap();
        fs::remove_file(dir.path().join("tracked.txt")).unwrap();
        fs::create_dir_all(dir.path().join("tracked.txt")).unwrap();
        fs::write(dir.path().join("tracked.txt/inner"), "data").unwrap();

        let err = s
            .apply(&snap.ref_name, &MergePolicy::default(), &[])
            .unwrap_err();
        assert!(matches!(err, CairnError::WriteFailed(_)));
        assert_eq!(fs::read_to_string(dir.path().join("tracked.txt/inner")).unwrap(), "data");
        assert_eq!(fs::read_to_string(dir.path().join("other.txt")).unwrap(), "keep me");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = init_repo();
        let s = store(&dir);
        let node = NodeId::from("n1");
        let snap = s.create(&label(CheckpointRole::Assistant, 3, &node)).unwrap();

        s.delete(&snap.ref_name).unwrap();
        s.delete(&snap.ref_name).unwrap();
        assert!(s.list("").unwrap().is_empty());
    }

    #[test]
    fn test_list_orders_by_sequence_and_reads_trailers() {
        let dir = init_repo();
        let s = store(&dir);
        let start = NodeId::from("start");
        let u1 = NodeId::from("u1");
        let a1 = NodeId::from("a1");

        s.create(&label(CheckpointRole::Assistant, 12, &a1)).unwrap();
        s.create(&label(CheckpointRole::Resume, 1, &start)).unwrap();
        fs::write(dir.path().join("tracked.txt"), "u1\n").unwrap();
        s.create(&label(CheckpointRole::User, 2, &u1)).unwrap();

        let all = s.list("").unwrap();
        let seqs: Vec<u64> = all.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 12]);
        assert_eq!(all[0].role, CheckpointRole::Resume);
        assert_eq!(all[1].node_id, Some(u1));
        assert_eq!(all[2].role, CheckpointRole::Assistant);

        let resumes = s.list("checkpoint-resume-").unwrap();
        assert_eq!(resumes.len(), 1);
    }

    #[test]
    fn test_sessions_use_disjoint_namespaces() {
        let dir = init_repo();
        let a = GitSnapshotStore::new(dir.path(), SessionId::new("alpha").unwrap());
        let b = GitSnapshotStore::new(dir.path(), SessionId::new("beta").unwrap());
        let node = NodeId::from("n");
        a.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();

        assert_eq!(a.list("").unwrap().len(), 1);
        assert!(b.list("").unwrap().is_empty());
    }

    #[test]
    fn test_large_untracked_files_are_skipped() {
        let dir = init_repo();
        let s = store(&dir).with_max_untracked_bytes(4);
        let node = NodeId::from("n1");
        fs::write(dir.path().join("big.bin"), "0123456789").unwrap();
        let snap = s.create(&label(CheckpointRole::Resume, 1, &node)).unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        let oid = Oid::from_str(&snap.object_id).unwrap();
        let tree = repo.find_commit(oid).unwrap().tree().unwrap();
        assert!(tree.get_name("big.bin").is_none());
        assert!(tree.get_name("tracked.txt").is_some());
    }
}
