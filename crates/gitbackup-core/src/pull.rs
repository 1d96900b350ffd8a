//! The pull engine.
//!
//! A pull walks the configured source directories, turning plain files into
//! blobs under each backup prefix and fetching every `*.git` repository's
//! objects into the backup object database. One synthetic merge commit then
//! advances the backup head: its tree carries the files plus the
//! `backup.refs` manifest, and its parent list carries every pulled tip
//! (non-commit tips through their commit encodings), so a single head id
//! pins the entire backup state and keeps all of it alive across repacks.
//!
//! The outer control loop is intentionally sequential: the already-have set
//! only ever grows, which keeps the incremental-fetch reasoning valid while
//! sources are being backed up one after another.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::encode::NoncommitCodec;
use crate::error::{BackupError, Result};
use crate::fetch::{self, RemoteRef};
use crate::gitcmd::{Git, Run};
use crate::index;
use crate::odb::{Backup, ObjKind};
use crate::paths;
use crate::pool::CancelToken;
use crate::refname;
use crate::sha1::Sha1;

/// The exclusion token: no two pulls may run against one backup repository.
const LOCK_REF: &str = "refs/backup.locked";

/// One `<dir>:<prefix>` pair.
#[derive(Clone, Debug)]
pub struct PullSpec {
    pub dir: std::path::PathBuf,
    pub prefix: String,
}

/// Pull `specs` into the backup repository.
pub fn pull(backup: &Backup, git: &Git, specs: &[PullSpec], cancel: &CancelToken) -> Result<()> {
    // refs/backup/20150820-2109/ : staging namespace unique to this run
    let backup_time = chrono::Local::now().format("%Y%m%d-%H%M").to_string();
    let work_ns = format!("refs/backup/{backup_time}/");

    let lock = BackupLock::acquire(backup)?;

    let result = pull_locked(backup, git, specs, &backup_time, &work_ns, cancel);
    if result.is_err() {
        // a failed pull must not leave staging refs behind either
        if let Err(e) = cleanup_work_namespace(backup, git, &work_ns) {
            warn!("cleaning work namespace: {e}");
        }
    }

    match result {
        Ok(()) => lock.release(),
        Err(e) => {
            let _ = lock.release();
            Err(e)
        }
    }
}

fn pull_locked(
    backup: &Backup,
    git: &Git,
    specs: &[PullSpec],
    backup_time: &str,
    work_ns: &str,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    // make sure there is a root commit
    let head = match backup.head_id()? {
        Some(head) => head,
        None => {
            info!("# creating root commit");
            let root = backup.commit_tree(
                backup.empty_tree()?,
                &[],
                b"Initialize git-backup repository",
                None,
            )?;
            git.check(
                &["update-ref", "-m", "git-backup pull init", "HEAD", &root.to_hex()],
                Run::default(),
            )?;
            root
        }
    };

    // One codec for the whole pull: it seeds the already-have set below and
    // encodes the new manifest later, sharing the memo between both.
    let codec = NoncommitCodec::new();

    // Already-have: all commits reachable from the head, plus every original
    // id in the current manifest whose encoding differs. The encoding commit
    // pins a tree or blob original inside its own tree, but a tag original
    // survives only as bytes in the commit message and is prunable once the
    // staging refs are gone; write such objects back from their encodings
    // before promising the ids are present, or an unchanged source would be
    // skipped by the fetch while its tag ids are missing from the odb.
    let mut already_have = backup.reachable_commits(head)?;
    if let Some(blob) = backup.blob_at(head, "backup.refs")? {
        let text = String::from_utf8(blob)
            .map_err(|_| BackupError::Other("backup.refs is not valid UTF-8".to_string()))?;
        let mut recreated: BTreeSet<Sha1> = BTreeSet::new();
        for repo in index::parse_backup_refs(&text)? {
            for r in repo.refs.values() {
                if r.sha1 != r.repr {
                    if recreated.insert(r.repr) {
                        codec.recreate_from_commit(backup, r.repr)?;
                    }
                    already_have.insert(r.sha1);
                }
            }
        }
    }
    debug!("already-have set: {} ids", already_have.len());

    let mut git_index = backup.index()?;
    // (repository path, refs at fetch time) in walk order; the manifest is
    // built from these in-memory snapshots, never re-read from the work
    // namespace, so a source changing mid-pull cannot skew it
    let mut repos: Vec<(Vec<u8>, Vec<RemoteRef>)> = Vec::new();

    for spec in specs {
        cancel.check()?;
        // start from a clean prefix namespace so removals do not go stale
        git_index.remove_dir(Path::new(&spec.prefix), 0)?;
        pull_dir(
            backup,
            git,
            spec,
            &mut git_index,
            &mut already_have,
            &mut repos,
            work_ns,
            cancel,
        )?;
    }

    // All refs from all found repositories are known; build the manifest and
    // the parent list for the merge commit. Tag/tree/blob tips are encoded
    // as commits, memoized since forks share many identical tags.
    let mut lines: Vec<String> = Vec::new();
    let mut parents: BTreeSet<Sha1> = BTreeSet::new();
    for (repopath, refv) in &repos {
        let escaped = refname::escape_path(repopath);
        for r in refv {
            let refstring = format!("{escaped}/{}", r.name);
            if backup.object_kind(r.sha1)? == ObjKind::Commit {
                lines.push(index::format_line(r.sha1, &refstring, None));
                parents.insert(r.sha1);
            } else {
                let repr = codec.represent_as_commit(backup, r.sha1)?;
                lines.push(index::format_line(r.sha1, &refstring, Some(repr)));
                parents.insert(repr);
            }
        }
    }
    lines.sort();
    let backup_refs = lines.join("\n");

    let refs_blob = backup.write_object(backup_refs.as_bytes(), ObjKind::Blob)?;
    index_add(&mut git_index, 0o100644, refs_blob, b"backup.refs".to_vec())?;

    // index is ready: tree, merge commit, head
    let tree = backup.write_index_tree(&mut git_index)?;
    let mut parentv = vec![head];
    parentv.extend(parents.iter().copied());
    let commit = backup.commit_tree(
        tree,
        &parentv,
        format!("Git-backup {backup_time}").as_bytes(),
        None,
    )?;
    git.check(
        &[
            "update-ref",
            "-m",
            "git-backup pull",
            "HEAD",
            &commit.to_hex(),
            &head.to_hex(),
        ],
        Run::default(),
    )?;

    // staging refs served their purpose; leaving them (or their emptied
    // directories) would slow every future reference scan
    cleanup_work_namespace(backup, git, work_ns)?;

    if !backup.is_bare() {
        update_working_copy(backup, git, head, commit)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn pull_dir(
    backup: &Backup,
    git: &Git,
    spec: &PullSpec,
    git_index: &mut git2::Index,
    already_have: &mut BTreeSet<Sha1>,
    repos: &mut Vec<(Vec<u8>, Vec<RemoteRef>)>,
    work_ns: &str,
    cancel: &CancelToken,
) -> Result<()> {
    // a vanished entry mid-walk is routine; a missing source directory is a
    // configuration error and must not silently empty the prefix
    std::fs::symlink_metadata(&spec.dir).map_err(|e| BackupError::PathIo {
        path: format!("source directory {}", spec.dir.display()),
        source: e,
    })?;

    let walker = WalkDir::new(&spec.dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        // *.git/objects is transferred through fetch, never as plain files
        .filter_entry(|e| !is_git_objects_dir(e.path(), e.file_type().is_dir()));

    for entry in walker {
        cancel.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            // concurrent deletion during the walk is routine on live sources
            Err(e) if is_not_found(&e) => {
                warn!("skipping vanished entry: {e}");
                continue;
            }
            Err(e) => return Err(walk_error(e)),
        };

        let ftype = entry.file_type();
        if ftype.is_dir() {
            if paths::ends_with_git(entry.file_name()) {
                pull_repo(backup, git, spec, entry.path(), already_have, repos, work_ns)?;
            }
            continue;
        }
        if !ftype.is_file() && !ftype.is_symlink() {
            debug!("skipping special file {}", entry.path().display());
            continue;
        }

        info!("# file {}\t<- {}", spec.prefix, entry.path().display());
        let Some((mode, blob)) = file_to_blob(backup, entry.path())? else {
            warn!("skipping vanished file {}", entry.path().display());
            continue;
        };
        let ipath = paths::to_prefix_path(&spec.dir, &spec.prefix, entry.path())?;
        index_add(git_index, mode, blob, ipath)?;
    }
    Ok(())
}

/// Fetch one source repository and stage its reference snapshot under the
/// work namespace. The snapshot is installed only after the fetch and its
/// completeness check succeeded, so the namespace never names objects the
/// backup does not fully hold.
fn pull_repo(
    backup: &Backup,
    git: &Git,
    spec: &PullSpec,
    path: &Path,
    already_have: &mut BTreeSet<Sha1>,
    repos: &mut Vec<(Vec<u8>, Vec<RemoteRef>)>,
    work_ns: &str,
) -> Result<()> {
    info!("# git  {}\t<- {}", spec.prefix, path.display());
    let (refv, fetched) = fetch::fetch(git, path, already_have)?;
    debug!("{}: {} refs, {} fetched", path.display(), refv.len(), fetched.len());

    let repopath = paths::to_prefix_path(&spec.dir, &spec.prefix, path)?;
    let escaped = refname::escape_path(&repopath);

    if !refv.is_empty() {
        let mut batch = String::new();
        for r in &refv {
            batch.push_str(&format!("update {work_ns}{escaped}/{} {}\n", r.name, r.sha1));
        }
        git.check(
            &["update-ref", "--stdin"],
            Run {
                stdin: Some(batch.as_bytes()),
                ..Run::default()
            },
        )?;
    }

    // tips are now protected by refs; later sources can rely on them
    for r in &refv {
        already_have.insert(r.sha1);
    }
    repos.push((repopath, refv));
    Ok(())
}

/// file → blob id + git mode. `Ok(None)` when the file vanished between the
/// walk and the read.
fn file_to_blob(backup: &Backup, path: &Path) -> Result<Option<(u32, Sha1)>> {
    let vanished = |e: &std::io::Error| e.kind() == std::io::ErrorKind::NotFound;
    let io = |e: std::io::Error| BackupError::PathIo {
        path: path.display().to_string(),
        source: e,
    };

    let md = match std::fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if vanished(&e) => return Ok(None),
        Err(e) => return Err(io(e)),
    };

    if md.file_type().is_symlink() {
        let target = match std::fs::read_link(path) {
            Ok(t) => t,
            Err(e) if vanished(&e) => return Ok(None),
            Err(e) => return Err(io(e)),
        };
        let blob = backup.write_object(&paths::path_bytes(&target), ObjKind::Blob)?;
        Ok(Some((0o120000, blob)))
    } else {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if vanished(&e) => return Ok(None),
            Err(e) => return Err(io(e)),
        };
        let blob = backup.write_object(&data, ObjKind::Blob)?;
        Ok(Some((blob_mode(&md), blob)))
    }
}

#[cfg(unix)]
fn blob_mode(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if md.permissions().mode() & 0o111 != 0 {
        0o100755
    } else {
        0o100644
    }
}

#[cfg(not(unix))]
fn blob_mode(_md: &std::fs::Metadata) -> u32 {
    0o100644
}

fn index_add(index: &mut git2::Index, mode: u32, blob: Sha1, path: Vec<u8>) -> Result<()> {
    let entry = git2::IndexEntry {
        ctime: git2::IndexTime::new(0, 0),
        mtime: git2::IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: 0,
        id: blob.into(),
        flags: 0,
        flags_extended: 0,
        path,
    };
    index.add(&entry)?;
    Ok(())
}

fn is_git_objects_dir(path: &Path, is_dir: bool) -> bool {
    is_dir
        && path.file_name() == Some(OsStr::new("objects"))
        && path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(paths::ends_with_git)
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

fn walk_error(e: walkdir::Error) -> BackupError {
    let path = e
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "walk".to_string());
    match e.into_io_error() {
        Some(io) => BackupError::PathIo { path, source: io },
        None => BackupError::Other(format!("{path}: filesystem loop during walk")),
    }
}

/// Delete every reference under the work namespace in one batch, verify none
/// remain, and sweep the emptied loose-ref directories.
fn cleanup_work_namespace(backup: &Backup, git: &Git, work_ns: &str) -> Result<()> {
    let glob = format!("{work_ns}*");
    let names = backup.reference_names_glob(&glob)?;
    if !names.is_empty() {
        let mut batch = String::new();
        for name in &names {
            batch.push_str(&format!("delete {name}\n"));
        }
        git.check(
            &["update-ref", "--stdin"],
            Run {
                stdin: Some(batch.as_bytes()),
                ..Run::default()
            },
        )?;
    }
    if !backup.reference_names_glob(&glob)?.is_empty() {
        return Err(BackupError::Other(format!(
            "backup refs under {work_ns} not deleted properly"
        )));
    }

    let ns_dir = backup.git_path().join(work_ns.trim_end_matches('/'));
    match std::fs::remove_dir_all(&ns_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BackupError::PathIo {
                path: ns_dir.display().to_string(),
                source: e,
            })
        }
    }
    // and refs/backup itself, if this was the only run in it
    let _ = std::fs::remove_dir(backup.git_path().join("refs/backup"));
    Ok(())
}

/// Refresh an attached working copy by applying the diff between the old and
/// new heads. `checkout-index` would miss deletions; the diff keeps them.
fn update_working_copy(backup: &Backup, git: &Git, old: Sha1, new: Sha1) -> Result<()> {
    let diff = git.output_raw(
        &["diff", "--binary", &old.to_hex(), &new.to_hex()],
        Run::default(),
    )?;
    if diff.is_empty() {
        return Ok(());
    }
    let workdir = backup
        .workdir()
        .ok_or_else(|| BackupError::Other("repository has no working copy".to_string()))?;
    let stat = git.output(
        &["apply", "--stat", "--apply", "--binary", "--whitespace=nowarn"],
        Run {
            stdin: Some(&diff),
            current_dir: Some(&workdir),
            ..Run::default()
        },
    )?;
    info!("{stat}");
    Ok(())
}

// -------------------------------------------------------------------------
// Lock
// -------------------------------------------------------------------------

/// Held `refs/backup.locked` token. Points at the empty tree; creation is
/// atomic, so a second pull fails with `Locked` instead of interleaving.
struct BackupLock<'a> {
    backup: &'a Backup,
    held: bool,
}

impl<'a> BackupLock<'a> {
    fn acquire(backup: &'a Backup) -> Result<BackupLock<'a>> {
        let empty = backup.empty_tree()?;
        backup.reference_create(LOCK_REF, empty, "git-backup: locked for pull")?;
        Ok(BackupLock { backup, held: true })
    }

    fn release(mut self) -> Result<()> {
        self.held = false;
        self.backup.reference_delete(LOCK_REF)
    }
}

impl Drop for BackupLock<'_> {
    fn drop(&mut self) {
        if self.held {
            let _ = self.backup.reference_delete(LOCK_REF);
        }
    }
}
