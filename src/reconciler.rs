//! Three-way reconciliation: turns two current indices plus two
//! previous-run indices into a minimal, conflict-resolved sequence of
//! filesystem operations.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::LogicalError;
use crate::index::{self, FileEntry, FolderEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Mkdir,
    Rmdir,
    Rm,
    Cp,
    Push,
    Fetch,
    Mv,
}

/// A single planned filesystem mutation. `src`/`dst` are paths relative to
/// the synchronized tree's root (identical in meaning on both peers); `remote`
/// names which peer must execute it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncCommand {
    pub verb: Verb,
    pub src: String,
    pub dst: Option<String>,
    pub remote: bool,
}

impl SyncCommand {
    pub fn is_copy(&self) -> bool {
        matches!(self.verb, Verb::Cp | Verb::Push | Verb::Fetch)
    }
    pub fn is_move(&self) -> bool {
        matches!(self.verb, Verb::Mv)
    }
    pub fn is_removal(&self) -> bool {
        matches!(self.verb, Verb::Rm | Verb::Rmdir)
    }

    /// Space-joined quoted rendering used both for `sync_commands.sh`
    /// export and verbose-mode prompts.
    pub fn render(&self) -> String {
        let verb = match self.verb {
            Verb::Mkdir => "mkdir",
            Verb::Rmdir => "rmdir",
            Verb::Rm => "rm",
            Verb::Cp => "cp",
            Verb::Push => "push",
            Verb::Fetch => "fetch",
            Verb::Mv => "mv",
        };
        match &self.dst {
            Some(dst) => format!("{} \"{}\" \"{}\"", verb, self.src, dst),
            None => format!("{} \"{}\"", verb, self.src),
        }
    }
}

/// Modified-time strings must be equal length; unequal lengths are a hard
/// logical error rather than a silent mis-order.
pub fn compare_mtime(a: &str, b: &str) -> Result<Ordering, LogicalError> {
    if a.len() != b.len() {
        return Err(LogicalError(format!(
            "modified-time strings of unequal length ({} vs {}): '{}' vs '{}'",
            a.len(),
            b.len(),
            a,
            b
        )));
    }
    Ok(a.cmp(b))
}

fn relative(path: &str, prefix: &str) -> String {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => path.to_string(),
    }
}

fn abs_path(root: &FolderEntry, rel: &str) -> String {
    if rel.is_empty() {
        root.name.clone()
    } else {
        format!("{}/{}", root.name, rel)
    }
}

fn remap_path(path: &str, source_prefix: &str, target_prefix: &str) -> String {
    match path.strip_prefix(source_prefix) {
        Some(rest) => format!("{}{}", target_prefix, rest),
        None => path.to_string(),
    }
}

/// Top-level entry point. Runs the remote->local pass, strips removed paths
/// from both trees, runs the symmetric local->remote pass reusing the
/// mutated state, merges deletion logs, and returns the sorted command list.
#[allow(clippy::too_many_arguments)]
pub fn reconcile(
    local_root: &mut FolderEntry,
    local_last: Option<&FolderEntry>,
    remote_root: &mut FolderEntry,
    remote_last: Option<&FolderEntry>,
    local_deletions: &[String],
    remote_deletions: &[String],
) -> Vec<SyncCommand> {
    let mut commands = Vec::new();

    let local_prefix = local_root.name.clone();
    let remote_prefix = remote_root.name.clone();

    let remote_view = remote_root.clone();
    reconcile_level(
        &remote_view,
        remote_root,
        local_root,
        local_last,
        &remote_prefix,
        &local_prefix,
        &mut commands,
        false,
    );

    apply_removals(local_root, remote_root, &commands);

    let local_view = local_root.clone();
    reconcile_level(
        &local_view,
        local_root,
        remote_root,
        remote_last,
        &local_prefix,
        &remote_prefix,
        &mut commands,
        true,
    );

    let deleted: HashSet<String> = local_deletions
        .iter()
        .map(|p| relative(p, &local_prefix))
        .chain(remote_deletions.iter().map(|p| relative(p, &remote_prefix)))
        .collect();
    commands.retain(|c| !deleted.contains(&c.src));

    sort_commands(&mut commands);
    commands
}

/// Walks one level of the "source" snapshot against the real "target" tree,
/// emitting operations and mutating `target_root` (structurally) and
/// `source_root` (metadata only, to reflect a resolved conflict) in place.
#[allow(clippy::too_many_arguments)]
fn reconcile_level(
    source_view: &FolderEntry,
    source_root: &mut FolderEntry,
    target_root: &mut FolderEntry,
    target_last_root: Option<&FolderEntry>,
    source_prefix: &str,
    target_prefix: &str,
    commands: &mut Vec<SyncCommand>,
    direction: bool,
) {
    for sub in &source_view.folders {
        let target_path = remap_path(&sub.name, source_prefix, target_prefix);
        let rel = relative(&target_path, target_prefix);

        if index::extract_folder(target_root, &target_path).is_some() {
            reconcile_level(
                sub,
                source_root,
                target_root,
                target_last_root,
                source_prefix,
                target_prefix,
                commands,
                direction,
            );
            continue;
        }

        let existed_before = target_last_root
            .and_then(|last| index::extract_folder(last, &target_path))
            .is_some();

        if target_last_root.is_none() || !existed_before {
            commands.push(SyncCommand {
                verb: Verb::Mkdir,
                src: rel,
                dst: None,
                remote: direction,
            });
            let shell = FolderEntry {
                name: target_path.clone(),
                permissions: sub.permissions,
                path_type: sub.path_type,
                modified_time: sub.modified_time.clone(),
                folders: Vec::new(),
                files: Vec::new(),
            };
            if let Err(e) = index::insert_folder(target_root, shell, &target_path) {
                eprintln!("logical error: {e}");
                continue;
            }
            reconcile_level(
                sub,
                source_root,
                target_root,
                target_last_root,
                source_prefix,
                target_prefix,
                commands,
                direction,
            );
        } else {
            // Existed previously, now gone on the target side: drain
            // children first, then remove the shell on the source side.
            reconcile_level(
                sub,
                source_root,
                target_root,
                target_last_root,
                source_prefix,
                target_prefix,
                commands,
                direction,
            );
            commands.push(SyncCommand {
                verb: Verb::Rmdir,
                src: rel,
                dst: None,
                remote: !direction,
            });
        }
    }

    for file in &source_view.files {
        reconcile_file(
            file,
            source_root,
            target_root,
            target_last_root,
            source_prefix,
            target_prefix,
            commands,
            direction,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn reconcile_file(
    file: &FileEntry,
    source_root: &mut FolderEntry,
    target_root: &mut FolderEntry,
    target_last_root: Option<&FolderEntry>,
    source_prefix: &str,
    target_prefix: &str,
    commands: &mut Vec<SyncCommand>,
    direction: bool,
) {
    let target_path = remap_path(&file.name, source_prefix, target_prefix);
    let rel = relative(&target_path, target_prefix);

    let existing = index::extract_file(target_root, &target_path)
        .map(|f| (f.hash.clone(), f.modified_time.clone()));

    if let Some((local_hash, local_mtime)) = existing {
        if local_hash == file.hash {
            return;
        }
        match compare_mtime(&local_mtime, &file.modified_time) {
            Err(e) => {
                eprintln!("{e}");
            }
            Ok(Ordering::Equal) => {
                eprintln!(
                    "logical error: identical timestamps with differing hashes for '{}'",
                    rel
                );
            }
            Ok(Ordering::Less) => {
                // target's copy is the older one; source is newer.
                commands.push(SyncCommand {
                    verb: Verb::Rm,
                    src: rel.clone(),
                    dst: None,
                    remote: direction,
                });
                let verb = if direction { Verb::Push } else { Verb::Fetch };
                commands.push(SyncCommand {
                    verb,
                    src: rel.clone(),
                    dst: Some(rel.clone()),
                    remote: verb == Verb::Push,
                });
                if let Some(tf) = index::extract_file_mut(target_root, &target_path) {
                    tf.hash = file.hash.clone();
                    tf.modified_time = file.modified_time.clone();
                }
            }
            Ok(Ordering::Greater) => {
                // source's copy is the older one; target is newer.
                commands.push(SyncCommand {
                    verb: Verb::Rm,
                    src: rel.clone(),
                    dst: None,
                    remote: !direction,
                });
                let verb = if direction { Verb::Fetch } else { Verb::Push };
                commands.push(SyncCommand {
                    verb,
                    src: rel.clone(),
                    dst: Some(rel.clone()),
                    remote: verb == Verb::Push,
                });
                if let Some(sf) = index::extract_file_mut(source_root, &file.name) {
                    sf.hash = local_hash;
                    sf.modified_time = local_mtime;
                }
            }
        }
        return;
    }

    // Missing on the target side entirely.
    let acquire = |target_root: &mut FolderEntry, commands: &mut Vec<SyncCommand>| {
        if let Some(found) = index::find_file_by_hash(target_root, &file.hash) {
            let found_rel = relative(&found, target_prefix);
            commands.push(SyncCommand {
                verb: Verb::Cp,
                src: found_rel,
                dst: Some(rel.clone()),
                remote: direction,
            });
        } else {
            let verb = if direction { Verb::Push } else { Verb::Fetch };
            commands.push(SyncCommand {
                verb,
                src: rel.clone(),
                dst: Some(rel.clone()),
                remote: verb == Verb::Push,
            });
        }
        let mut entry = file.clone();
        entry.name = target_path.clone();
        if let Err(e) = index::insert_file(target_root, entry, &target_path) {
            eprintln!("logical error: {e}");
        }
    };

    match target_last_root {
        None => acquire(target_root, commands),
        Some(last) => {
            if index::extract_file(last, &target_path).is_some() {
                // Was deliberately deleted on the target side; remove the
                // source's stale copy too instead of re-acquiring it.
                commands.push(SyncCommand {
                    verb: Verb::Rm,
                    src: rel,
                    dst: None,
                    remote: !direction,
                });
            } else {
                acquire(target_root, commands);
            }
        }
    }
}

fn apply_removals(local_root: &mut FolderEntry, remote_root: &mut FolderEntry, commands: &[SyncCommand]) {
    for cmd in commands {
        let is_folder = match cmd.verb {
            Verb::Rmdir => true,
            Verb::Rm => false,
            _ => continue,
        };
        let local_abs = abs_path(local_root, &cmd.src);
        if index::remove_path(local_root, &local_abs, is_folder) {
            continue;
        }
        let remote_abs = abs_path(remote_root, &cmd.src);
        if !index::remove_path(remote_root, &remote_abs, is_folder) {
            eprintln!(
                "logical error: path '{}' not found in either index during deletion cleanup",
                cmd.src
            );
        }
    }
}

fn priority(cmd: &SyncCommand) -> u8 {
    if cmd.verb == Verb::Mkdir {
        4
    } else if cmd.is_copy() {
        3
    } else if cmd.is_move() {
        2
    } else {
        1
    }
}

/// Stable sort: removals first, then moves, then copies/fetches/pushes,
/// then everything else (`mkdir`). Matches the original `sortCommands()`
/// ordering exactly, so that a removal sharing a primary path with a
/// transfer always runs before it. Both peers independently create any
/// parent directory a transfer needs, so `mkdir` does not need to be
/// sorted ahead of the fetches it hosts.
pub fn sort_commands(commands: &mut [SyncCommand]) {
    commands.sort_by_key(priority);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Index, IndexKind, PathType};
    use std::fs;
    use tempfile::tempdir;

    fn build(dir: &std::path::Path, kind: IndexKind) -> FolderEntry {
        Index::build(dir, kind).unwrap().root
    }

    #[test]
    fn rename_via_hash_copy() {
        // No last-run index on either side, so neither peer can tell that
        // "a/foo.bin" and "a/bar.bin" are the same file renamed rather than
        // two independently-intended names: each pass finds the other's
        // name missing, locates the matching content by hash, and copies
        // it in locally rather than re-transferring the bytes. Both names
        // end up present on both peers; no `rm` is emitted for either.
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        fs::create_dir(local_dir.path().join("a")).unwrap();
        fs::write(local_dir.path().join("a/foo.bin"), b"same-bytes").unwrap();
        fs::create_dir(remote_dir.path().join("a")).unwrap();
        fs::write(remote_dir.path().join("a/bar.bin"), b"same-bytes").unwrap();

        let mut local = build(local_dir.path(), IndexKind::Local);
        let mut remote = build(remote_dir.path(), IndexKind::Remote);

        let commands = reconcile(&mut local, None, &mut remote, None, &[], &[]);

        assert!(commands
            .iter()
            .any(|c| c.verb == Verb::Cp && c.src == "a/foo.bin" && c.dst.as_deref() == Some("a/bar.bin") && !c.remote));
        assert!(commands
            .iter()
            .any(|c| c.verb == Verb::Cp && c.src == "a/bar.bin" && c.dst.as_deref() == Some("a/foo.bin") && c.remote));
        assert!(commands.iter().all(|c| !c.is_removal()));
    }

    #[test]
    fn conflicting_edits_newer_wins() {
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        fs::write(local_dir.path().join("x.txt"), b"old").unwrap();
        fs::write(remote_dir.path().join("x.txt"), b"new").unwrap();

        let mut local = build(local_dir.path(), IndexKind::Local);
        let mut remote = build(remote_dir.path(), IndexKind::Remote);
        // Force remote to be strictly newer and hashes to differ.
        remote.files[0].modified_time = "2024-01-02_11:00.00.000".into();
        local.files[0].modified_time = "2024-01-02_10:00.00.000".into();
        local.files[0].hash = "1".repeat(32);
        remote.files[0].hash = "2".repeat(32);

        let commands = reconcile(&mut local, None, &mut remote, None, &[], &[]);
        let rm_pos = commands
            .iter()
            .position(|c| c.verb == Verb::Rm && c.src == "x.txt" && !c.remote)
            .unwrap();
        let fetch_pos = commands
            .iter()
            .position(|c| c.verb == Verb::Fetch && c.src == "x.txt" && !c.remote)
            .unwrap();
        assert!(
            rm_pos < fetch_pos,
            "rm must precede fetch on the same path or run_commands deletes the freshly-fetched file"
        );
    }

    #[test]
    fn identical_trees_emit_nothing() {
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        fs::write(local_dir.path().join("same.txt"), b"content").unwrap();
        fs::write(remote_dir.path().join("same.txt"), b"content").unwrap();

        let mut local = build(local_dir.path(), IndexKind::Local);
        let mut remote = build(remote_dir.path(), IndexKind::Remote);

        let commands = reconcile(&mut local, Some(&local.clone()), &mut remote, Some(&remote.clone()), &[], &[]);
        assert!(commands.is_empty());
    }

    #[test]
    fn deletion_propagates_to_remote() {
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        // local has no y.txt; remote still has it; both last-runs had it.
        fs::write(remote_dir.path().join("y.txt"), b"data").unwrap();

        let local = build(local_dir.path(), IndexKind::Local);
        let remote = build(remote_dir.path(), IndexKind::Remote);

        let mut local_last = local.clone();
        local_last.files.push(FileEntry {
            name: format!("{}/y.txt", local_last.name),
            permissions: 0,
            path_type: PathType::File,
            modified_time: "2024-01-01_00:00.00.000".into(),
            hash: "deadbeef".repeat(4),
        });
        let mut remote_last = remote.clone();
        remote_last.files[0].hash = "deadbeef".repeat(4);

        let mut local_mut = local.clone();
        let mut remote_mut = remote.clone();
        let commands = reconcile(
            &mut local_mut,
            Some(&local_last),
            &mut remote_mut,
            Some(&remote_last),
            &[],
            &[],
        );
        assert!(commands
            .iter()
            .any(|c| c.verb == Verb::Rm && c.src == "y.txt" && c.remote));
    }

    #[test]
    fn folder_addition_emits_mkdir_and_fetch() {
        // mkdir sorts after the fetch (priority puts removals and transfers
        // ahead of "other" commands), but both peers create the fetch
        // destination's parent directory on receipt regardless of command
        // order, so the two are independent rather than ordering-dependent.
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        fs::create_dir(remote_dir.path().join("sub")).unwrap();
        fs::write(remote_dir.path().join("sub/a.bin"), b"payload").unwrap();

        let mut local = build(local_dir.path(), IndexKind::Local);
        let mut remote = build(remote_dir.path(), IndexKind::Remote);

        let commands = reconcile(&mut local, None, &mut remote, None, &[], &[]);
        assert!(commands.iter().any(|c| c.verb == Verb::Mkdir && c.src == "sub"));
        assert!(commands
            .iter()
            .any(|c| c.verb == Verb::Fetch && c.src == "sub/a.bin"));
    }

    #[test]
    fn unequal_length_mtime_skips_operation() {
        assert!(compare_mtime("2024-01-02_10:00.00.000", "2024-01-02_10:00").is_err());
    }

    #[test]
    fn identical_timestamps_with_differing_hashes_emit_no_transfer() {
        let local_dir = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        fs::write(local_dir.path().join("x.txt"), b"old").unwrap();
        fs::write(remote_dir.path().join("x.txt"), b"new").unwrap();

        let mut local = build(local_dir.path(), IndexKind::Local);
        let mut remote = build(remote_dir.path(), IndexKind::Remote);
        let same_mtime = "2024-01-02_10:00.00.000";
        local.files[0].modified_time = same_mtime.into();
        remote.files[0].modified_time = same_mtime.into();
        local.files[0].hash = "1".repeat(32);
        remote.files[0].hash = "2".repeat(32);

        let commands = reconcile(&mut local, None, &mut remote, None, &[], &[]);
        assert!(commands.iter().all(|c| c.src != "x.txt"));
    }
}
