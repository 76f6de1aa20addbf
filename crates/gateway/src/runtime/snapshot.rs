//! Pre-turn workspace fingerprint + selective byte-exact restore.
//!
//! Grounded on `core/agent/state_manager.py`'s `StateSnapshot`/
//! `StateManager` — capture a fingerprint (size/mtime/digest) for every
//! file in a pre-declared inventory, keep the original bytes so a later
//! `rollback` can restore byte-for-byte, and mark files that didn't
//! exist at snapshot time with a deletion sentinel so rollback removes
//! anything the turn created.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Modified,
    Deleted,
    Unchanged,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FilePreview {
    pub path: String,
    pub status: FileStatus,
    pub snapshot_size: Option<u64>,
    pub current_size: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RollbackEntry {
    pub path: String,
    pub status: FileStatus,
    pub restored: bool,
}

struct FileSnapshot {
    digest: String,
    size: u64,
    /// `None` means the file did not exist at snapshot time — a
    /// deletion sentinel; rollback removes the file if later created.
    content: Option<Vec<u8>>,
}

fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A pre-turn fingerprint of a session's working paths. At most one
/// active snapshot per session (enforced by the caller via
/// `SessionEngine::register_state_manager`, which simply replaces any
/// previous registration).
pub struct StateSnapshot {
    pub snapshot_id: Uuid,
    pub session_id: String,
    pub root: PathBuf,
    files: HashMap<String, FileSnapshot>,
}

impl StateSnapshot {
    /// Empty snapshot over `root` with no inventory — used when a
    /// session has no declared working paths yet, or in tests.
    pub fn new(session_id: String, root: PathBuf) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            session_id,
            root,
            files: HashMap::new(),
        }
    }

    /// Capture `size + mtime + content_digest` (and the raw bytes, for
    /// byte-exact restore) for every path in `inventory`, relative to
    /// `root`. Missing files are recorded as deletion sentinels.
    pub fn capture(
        session_id: String,
        root: PathBuf,
        inventory: &[PathBuf],
    ) -> std::io::Result<Self> {
        let mut files = HashMap::new();
        for rel in inventory {
            let rel_str = rel.to_string_lossy().to_string();
            let abs = root.join(rel);
            match std::fs::read(&abs) {
                Ok(bytes) => {
                    let digest = digest_of(&bytes);
                    let size = bytes.len() as u64;
                    files.insert(
                        rel_str,
                        FileSnapshot {
                            digest,
                            size,
                            content: Some(bytes),
                        },
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    files.insert(
                        rel_str,
                        FileSnapshot {
                            digest: String::new(),
                            size: 0,
                            content: None,
                        },
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            snapshot_id: Uuid::new_v4(),
            session_id,
            root,
            files,
        })
    }

    fn current_status(&self, rel: &str, snap: &FileSnapshot) -> (FileStatus, Option<u64>) {
        let abs = self.root.join(rel);
        match std::fs::read(&abs) {
            Ok(bytes) => {
                let current_size = bytes.len() as u64;
                if snap.content.is_none() {
                    // Didn't exist at snapshot time, exists now.
                    (FileStatus::Modified, Some(current_size))
                } else if digest_of(&bytes) == snap.digest {
                    (FileStatus::Unchanged, Some(current_size))
                } else {
                    (FileStatus::Modified, Some(current_size))
                }
            }
            Err(_) => {
                if snap.content.is_none() {
                    (FileStatus::Unchanged, None)
                } else {
                    (FileStatus::Deleted, None)
                }
            }
        }
    }
}

/// Owns the snapshot for one session and answers `preview`/`rollback`.
/// Registered on the session by `SessionEngine::register_state_manager`;
/// unregistered on successful rollback (spec §4.5 "Rollback semantics").
pub struct StateManager {
    snapshot: StateSnapshot,
}

impl StateManager {
    pub fn new(snapshot: StateSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot_id(&self) -> Uuid {
        self.snapshot.snapshot_id
    }

    /// Lists each file in the inventory as `modified | deleted |
    /// unchanged` with current vs. snapshot sizes.
    pub fn preview(&self) -> Vec<FilePreview> {
        let mut out: Vec<_> = self
            .snapshot
            .files
            .iter()
            .map(|(rel, snap)| {
                let (status, current_size) = self.snapshot.current_status(rel, snap);
                FilePreview {
                    path: rel.clone(),
                    status,
                    snapshot_size: snap.content.as_ref().map(|_| snap.size),
                    current_size,
                }
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Restores all files in the inventory (`file_paths = None`), or
    /// only the listed ones. Idempotent: a file already matching its
    /// snapshot is reported `unchanged` and not rewritten.
    pub fn rollback(&self, file_paths: Option<&[String]>) -> std::io::Result<Vec<RollbackEntry>> {
        let targets: Vec<&String> = match file_paths {
            Some(paths) => paths.iter().collect(),
            None => self.snapshot.files.keys().collect(),
        };

        let mut out = Vec::with_capacity(targets.len());
        for rel in targets {
            let Some(snap) = self.snapshot.files.get(rel) else {
                continue;
            };
            let (status, _) = self.snapshot.current_status(rel, snap);
            if status == FileStatus::Unchanged {
                out.push(RollbackEntry {
                    path: rel.clone(),
                    status,
                    restored: false,
                });
                continue;
            }

            let abs = self.snapshot.root.join(rel);
            match &snap.content {
                Some(bytes) => {
                    if let Some(parent) = abs.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&abs, bytes)?;
                }
                None => {
                    if abs.exists() {
                        std::fs::remove_file(&abs)?;
                    }
                }
            }
            out.push(RollbackEntry {
                path: rel.clone(),
                status,
                restored: true,
            });
        }
        Ok(out)
    }
}

/// Walks `root` recursively (skipping common VCS/build directories) and
/// returns every regular file as a root-relative path, for callers that
/// snapshot "the whole working directory" rather than a fixed list.
pub fn discover_inventory(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".git" || name == "target" || name == "node_modules" {
                continue;
            }
            if path.is_dir() {
                walk(&path, root, out)?;
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_rollback_restores_byte_exact() {
        let dir = std::env::temp_dir().join(format!("sa-snapshot-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("a.txt");
        std::fs::write(&file, b"original").unwrap();

        let snapshot =
            StateSnapshot::capture("s1".into(), dir.clone(), &[PathBuf::from("a.txt")]).unwrap();
        let manager = StateManager::new(snapshot);

        std::fs::write(&file, b"mutated by tool").unwrap();
        let preview = manager.preview();
        assert_eq!(preview[0].status, FileStatus::Modified);

        let result = manager.rollback(None).unwrap();
        assert!(result[0].restored);
        assert_eq!(std::fs::read(&file).unwrap(), b"original");

        // Second rollback is idempotent: reports unchanged, doesn't rewrite.
        let second = manager.rollback(None).unwrap();
        assert!(!second[0].restored);
        assert_eq!(second[0].status, FileStatus::Unchanged);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rollback_removes_file_created_during_turn() {
        let dir = std::env::temp_dir().join(format!("sa-snapshot-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("new.txt");
        // File doesn't exist at snapshot time.
        let snapshot =
            StateSnapshot::capture("s1".into(), dir.clone(), &[PathBuf::from("new.txt")]).unwrap();
        let manager = StateManager::new(snapshot);

        std::fs::write(&file, b"created by tool").unwrap();
        let preview = manager.preview();
        assert_eq!(preview[0].status, FileStatus::Modified);

        manager.rollback(None).unwrap();
        assert!(!file.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn selective_rollback_only_touches_listed_files() {
        let dir = std::env::temp_dir().join(format!("sa-snapshot-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), b"a").unwrap();
        std::fs::write(dir.join("b.txt"), b"b").unwrap();

        let snapshot = StateSnapshot::capture(
            "s1".into(),
            dir.clone(),
            &[PathBuf::from("a.txt"), PathBuf::from("b.txt")],
        )
        .unwrap();
        let manager = StateManager::new(snapshot);

        std::fs::write(dir.join("a.txt"), b"a-mutated").unwrap();
        std::fs::write(dir.join("b.txt"), b"b-mutated").unwrap();

        manager.rollback(Some(&["a.txt".to_string()])).unwrap();
        assert_eq!(std::fs::read(dir.join("a.txt")).unwrap(), b"a");
        assert_eq!(std::fs::read(dir.join("b.txt")).unwrap(), b"b-mutated");

        std::fs::remove_dir_all(&dir).ok();
    }
}
