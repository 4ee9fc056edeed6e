//! In-memory tree of folders and files with stable names, permissions,
//! timestamps, and per-file content hashes, persistable to a stable binary
//! schema (bincode over a `serde`-derived tree).

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hash;

/// Filenames excluded from indexing, colocated with the synced tree.
pub const RESERVED_NAMES: [&str; 5] = [
    ".folderindex",
    ".folderindex.last_run",
    ".remote.folderindex",
    ".remote.folderindex.last_run",
    "sync_commands.sh",
];

pub fn is_reserved(entry_name: &str) -> bool {
    RESERVED_NAMES.contains(&entry_name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Folder,
    File,
    Symlink,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Local,
    LocalLastRun,
    Remote,
    RemoteLastRun,
}

impl IndexKind {
    pub fn filename(self) -> &'static str {
        match self {
            IndexKind::Local => ".folderindex",
            IndexKind::LocalLastRun => ".folderindex.last_run",
            IndexKind::Remote => ".remote.folderindex",
            IndexKind::RemoteLastRun => ".remote.folderindex.last_run",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub permissions: u32,
    pub path_type: PathType,
    pub modified_time: String,
    pub hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    pub permissions: u32,
    pub path_type: PathType,
    pub modified_time: String,
    pub folders: Vec<FolderEntry>,
    pub files: Vec<FileEntry>,
}

pub struct Index {
    pub root: FolderEntry,
    pub kind: IndexKind,
    pub loaded_from_disk: bool,
    pub dirty: bool,
}

impl Index {
    /// Constructs or reloads the index: deserializes the on-disk index file
    /// if present, then walks the tree and updates/inserts/deletes entries
    /// to reflect the current state.
    pub fn build(root_path: &Path, kind: IndexKind) -> Result<Index> {
        let index_file = root_path.join(kind.filename());
        let seed = if index_file.is_file() {
            Some(load_index_file(&index_file)?)
        } else {
            None
        };
        let loaded_from_disk = seed.is_some();
        let canonical = root_path
            .canonicalize()
            .with_context(|| format!("canonicalizing root path {}", root_path.display()))?;

        let mut dirty = !loaded_from_disk;
        let root = walk_folder(&canonical, seed.as_ref(), &mut dirty)?;
        Ok(Index {
            root,
            kind,
            loaded_from_disk,
            dirty,
        })
    }

    /// Loads a previously-saved index verbatim, with no filesystem walk.
    ///
    /// Used for `Remote`/`RemoteLastRun` indices: those describe the peer's
    /// tree, not anything that exists on this machine, so there is nothing
    /// to walk and reusing `build`'s seed-and-rescan logic would silently
    /// substitute a scan of the local directory instead.
    pub fn load(root_path: &Path, kind: IndexKind) -> Result<Index> {
        let index_file = root_path.join(kind.filename());
        let root = load_index_file(&index_file)?;
        Ok(Index {
            root,
            kind,
            loaded_from_disk: true,
            dirty: false,
        })
    }

    /// Persists the index to disk if it was mutated since load.
    pub fn save(&mut self, root_path: &Path) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let path = root_path.join(self.kind.filename());
        let bytes = bincode::serialize(&self.root)
            .with_context(|| format!("serializing index {}", path.display()))?;
        fs::write(&path, bytes).with_context(|| format!("writing index file {}", path.display()))?;
        self.dirty = false;
        Ok(())
    }

    pub fn count(&self) -> usize {
        count_files(&self.root)
    }

    /// Paths present in `last_run` but absent from `self` — files the local
    /// tree has deliberately lost since the previous session.
    pub fn deletions_since(&self, last_run: Option<&FolderEntry>) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(last) = last_run {
            collect_missing(&self.root, last, &mut out);
        }
        out
    }
}

fn count_files(folder: &FolderEntry) -> usize {
    folder.files.len() + folder.folders.iter().map(count_files).sum::<usize>()
}

fn collect_missing(current: &FolderEntry, last: &FolderEntry, out: &mut Vec<String>) {
    for f in &last.files {
        if !current.files.iter().any(|cf| leaf_name(&cf.name) == leaf_name(&f.name)) {
            out.push(f.name.clone());
        }
    }
    for sub_last in &last.folders {
        match current
            .folders
            .iter()
            .find(|sf| leaf_name(&sf.name) == leaf_name(&sub_last.name))
        {
            Some(sub_current) => collect_missing(sub_current, sub_last, out),
            None => collect_all_paths(sub_last, out),
        }
    }
}

fn collect_all_paths(folder: &FolderEntry, out: &mut Vec<String>) {
    for f in &folder.files {
        out.push(f.name.clone());
    }
    for sub in &folder.folders {
        collect_all_paths(sub, out);
    }
}

pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn load_index_file(path: &Path) -> Result<FolderEntry> {
    let bytes = fs::read(path).with_context(|| format!("reading index file {}", path.display()))?;
    bincode::deserialize(&bytes).with_context(|| format!("decoding index file {}", path.display()))
}

/// Captures (permissions, type, modified-time) for `path`, retrying if the
/// filesystem clock moved past the capture instant — this avoids racing an
/// in-flight write whose mtime update hasn't settled yet.
fn capture_metadata(path: &Path) -> Result<(u32, PathType, String)> {
    loop {
        let captured_at = SystemTime::now();
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        let mtime = meta
            .modified()
            .with_context(|| format!("mtime of {}", path.display()))?;
        if mtime > captured_at {
            continue;
        }
        let permissions = file_permissions(&meta);
        let path_type = if meta.file_type().is_symlink() {
            PathType::Symlink
        } else if meta.is_dir() {
            PathType::Folder
        } else if meta.is_file() {
            PathType::File
        } else {
            PathType::Other
        };
        return Ok((permissions, path_type, format_mtime(mtime)));
    }
}

#[cfg(unix)]
fn file_permissions(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_permissions(_meta: &fs::Metadata) -> u32 {
    0
}

/// Fixed-width `YYYY-MM-DD_HH:MM.SS.fractional` format, chosen so that
/// lexicographic string comparison equals chronological comparison.
pub fn format_mtime(time: SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Local> = time.into();
    datetime.format("%Y-%m-%d_%H:%M.%S.%3f").to_string()
}

/// Inverse of [`format_mtime`], used to restore a received file's
/// modification time from its wire representation.
pub fn parse_mtime(s: &str) -> Result<SystemTime> {
    use chrono::TimeZone;
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d_%H:%M.%S.%3f")
        .with_context(|| format!("parsing modified-time string {s:?}"))?;
    let local = chrono::Local
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| anyhow!("ambiguous or invalid local time {s:?}"))?;
    Ok(SystemTime::from(local))
}

fn walk_folder(path: &Path, seed: Option<&FolderEntry>, dirty: &mut bool) -> Result<FolderEntry> {
    let (permissions, path_type, modified_time) = capture_metadata(path)?;
    let name = path.to_string_lossy().to_string();

    let mut files = Vec::new();
    let mut folders = Vec::new();
    let mut seen_files = std::collections::HashSet::new();
    let mut seen_folders = std::collections::HashSet::new();

    let mut entries: Vec<_> = fs::read_dir(path)
        .with_context(|| format!("reading directory {}", path.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let entry_name = entry.file_name().to_string_lossy().to_string();
        if is_reserved(&entry_name) {
            continue;
        }
        let entry_path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            seen_folders.insert(entry_name.clone());
            let seed_sub = seed
                .and_then(|s| s.folders.iter().find(|f| leaf_name(&f.name) == entry_name));
            folders.push(walk_folder(&entry_path, seed_sub, dirty)?);
        } else if file_type.is_file() {
            seen_files.insert(entry_name.clone());
            let (perm, pt, mtime) = capture_metadata(&entry_path)?;
            let existing = seed
                .and_then(|s| s.files.iter().find(|f| leaf_name(&f.name) == entry_name));
            let hash = match existing {
                Some(ex) if ex.permissions == perm && ex.path_type == pt && ex.modified_time == mtime => {
                    ex.hash.clone()
                }
                _ => {
                    *dirty = true;
                    hash::hash_file(&entry_path)?
                }
            };
            files.push(FileEntry {
                name: entry_path.to_string_lossy().to_string(),
                permissions: perm,
                path_type: pt,
                modified_time: mtime,
                hash,
            });
        }
        // Symlinks and other file types are outside the core reconciler's
        // scope (no symlink semantics) and are skipped entirely.
    }

    if let Some(seed) = seed {
        let lost_file = seed
            .files
            .iter()
            .any(|f| !seen_files.contains(leaf_name(&f.name)));
        let lost_folder = seed
            .folders
            .iter()
            .any(|f| !seen_folders.contains(leaf_name(&f.name)));
        if lost_file || lost_folder {
            *dirty = true;
        }
    }

    Ok(FolderEntry {
        name,
        permissions,
        path_type,
        modified_time,
        folders,
        files,
    })
}

// --- Navigation helpers used by the reconciler -----------------------------

pub fn extract_folder<'a>(root: &'a FolderEntry, target: &str) -> Option<&'a FolderEntry> {
    if root.name == target {
        return Some(root);
    }
    for folder in &root.folders {
        if target == folder.name || target.starts_with(&format!("{}/", folder.name)) {
            return extract_folder(folder, target);
        }
    }
    None
}

pub fn extract_folder_mut<'a>(root: &'a mut FolderEntry, target: &str) -> Option<&'a mut FolderEntry> {
    if root.name == target {
        return Some(root);
    }
    for folder in &mut root.folders {
        if target == folder.name || target.starts_with(&format!("{}/", folder.name)) {
            return extract_folder_mut(folder, target);
        }
    }
    None
}

pub fn extract_file<'a>(root: &'a FolderEntry, target: &str) -> Option<&'a FileEntry> {
    let parent = extract_folder(root, &parent_of(target))?;
    parent.files.iter().find(|f| f.name == target)
}

pub fn extract_file_mut<'a>(root: &'a mut FolderEntry, target: &str) -> Option<&'a mut FileEntry> {
    let parent = extract_folder_mut(root, &parent_of(target))?;
    parent.files.iter_mut().find(|f| f.name == target)
}

pub fn find_file_by_hash(root: &FolderEntry, target_hash: &str) -> Option<String> {
    for f in &root.files {
        if f.hash == target_hash {
            return Some(f.name.clone());
        }
    }
    for sub in &root.folders {
        if let Some(p) = find_file_by_hash(sub, target_hash) {
            return Some(p);
        }
    }
    None
}

/// Removes the file or folder at `target`. Returns `true` if found & removed.
pub fn remove_path(root: &mut FolderEntry, target: &str, is_folder: bool) -> bool {
    let Some(parent) = extract_folder_mut(root, &parent_of(target)) else {
        return false;
    };
    if is_folder {
        if let Some(pos) = parent.folders.iter().position(|f| f.name == target) {
            parent.folders.remove(pos);
            return true;
        }
    } else if let Some(pos) = parent.files.iter().position(|f| f.name == target) {
        parent.files.remove(pos);
        return true;
    }
    false
}

/// Splices `entry` into the tree at `path`, replacing metadata other than
/// the children (for folders) so subsequent lookups under `path` succeed.
pub fn insert_file(root: &mut FolderEntry, mut entry: FileEntry, path: &str) -> Result<()> {
    entry.name = path.to_string();
    let parent_path = parent_of(path);
    let parent = extract_folder_mut(root, &parent_path)
        .ok_or_else(|| anyhow!("copy_to: parent folder '{}' not found for '{}'", parent_path, path))?;
    match parent.files.iter_mut().find(|f| f.name == path) {
        Some(existing) => *existing = entry,
        None => parent.files.push(entry),
    }
    Ok(())
}

pub fn insert_folder(root: &mut FolderEntry, mut entry: FolderEntry, path: &str) -> Result<()> {
    entry.name = path.to_string();
    let parent_path = parent_of(path);
    let parent = extract_folder_mut(root, &parent_path)
        .ok_or_else(|| anyhow!("copy_to: parent folder '{}' not found for '{}'", parent_path, path))?;
    match parent.folders.iter_mut().find(|f| f.name == path) {
        Some(existing) => *existing = entry,
        None => parent.folders.push(entry),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn mkfile(entry: FolderEntry) -> FolderEntry {
        entry
    }

    #[test]
    fn build_walks_new_tree_and_marks_dirty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let index = Index::build(dir.path(), IndexKind::Local).unwrap();
        assert!(index.dirty);
        assert_eq!(index.count(), 2);
        assert_eq!(index.root.folders.len(), 1);
        assert_eq!(index.root.files.len(), 1);
    }

    #[test]
    fn reserved_names_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".folderindex"), b"stale").unwrap();
        fs::write(dir.path().join("sync_commands.sh"), b"echo").unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();

        let index = Index::build(dir.path(), IndexKind::Local).unwrap();
        assert_eq!(index.root.files.len(), 1);
        assert_eq!(index.root.files[0].name.ends_with("real.txt"), true);
    }

    #[test]
    fn unchanged_file_keeps_seed_hash_without_rehash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        let first = Index::build(dir.path(), IndexKind::Local).unwrap();
        let stored_hash = first.root.files[0].hash.clone();

        let mut seed = first.root.clone();
        // Corrupt the seed hash to prove the second build reuses it instead
        // of recomputing, because (perm, type, mtime) are unchanged.
        seed.files[0].hash = "deadbeef".repeat(4);
        let fake_seed = mkfile(seed);
        let mut dirty = false;
        let rebuilt = walk_folder(dir.path().canonicalize().unwrap().as_path(), Some(&fake_seed), &mut dirty).unwrap();
        assert_eq!(rebuilt.files[0].hash, "deadbeef".repeat(4));
        assert_ne!(rebuilt.files[0].hash, stored_hash);
    }

    #[test]
    fn deletions_since_reports_removed_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"1").unwrap();
        let last_run = Index::build(dir.path(), IndexKind::LocalLastRun).unwrap();
        fs::write(dir.path().join("gone.txt"), b"2").unwrap();
        let mut last_root = last_run.root.clone();
        last_root.files.push(FileEntry {
            name: format!("{}/gone.txt", last_root.name),
            permissions: 0,
            path_type: PathType::File,
            modified_time: format_mtime(SystemTime::now()),
            hash: "x".into(),
        });
        fs::remove_file(dir.path().join("gone.txt")).unwrap();

        let current = Index::build(dir.path(), IndexKind::Local).unwrap();
        let deletions = current.deletions_since(Some(&last_root));
        assert!(deletions.iter().any(|p| p.ends_with("gone.txt")));
    }

    #[test]
    fn extract_and_remove_roundtrip() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/f.txt"), b"x").unwrap();
        let mut index = Index::build(dir.path(), IndexKind::Local).unwrap();
        let target = index.root.folders[0].files[0].name.clone();

        assert!(extract_file(&index.root, &target).is_some());
        assert!(remove_path(&mut index.root, &target, false));
        assert!(extract_file(&index.root, &target).is_none());
    }
}
