//! The restore engine.
//!
//! Restoring inverts a pull: plain files come back out of the backup tree,
//! and every repository named by the manifest is rebuilt by generating a
//! pack closed over its fetch-time heads from the backup object database.
//! Pack generation dominates the cost, so a bounded worker pool extracts
//! repositories in parallel while the dispatcher keeps walking prefixes;
//! the first failure cancels everything in flight.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel as channel;
use tracing::{info, warn};

use crate::encode::NoncommitCodec;
use crate::error::{BackupError, Result};
use crate::gitcmd::{Git, Run};
use crate::index::{self, BackupRepo};
use crate::odb::{self, Backup, ObjKind};
use crate::paths;
use crate::pool::CancelToken;
use crate::sha1::Sha1;

/// One `<prefix>:<dir>` pair.
#[derive(Clone, Debug)]
pub struct RestoreSpec {
    pub prefix: String,
    pub dir: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Pack extraction workers; 0 means one per logical processor.
    pub jobs: usize,
}

/// A repository waiting for pack extraction.
struct PackRequest {
    repo: BackupRepo,
    dest: PathBuf,
}

/// Restore `specs` from the backup state named by `commit_ish`.
pub fn restore(
    backup: &Backup,
    git: &Git,
    commit_ish: &str,
    specs: &[RestoreSpec],
    opts: &RestoreOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let head = backup.revparse_commit(commit_ish)?;
    let manifest = backup
        .blob_at(head, "backup.refs")?
        .ok_or_else(|| BackupError::Other(format!("{head}: backup.refs not found")))?;
    let manifest = String::from_utf8(manifest)
        .map_err(|_| BackupError::Other("backup.refs is not valid UTF-8".to_string()))?;
    let repov = index::parse_backup_refs(&manifest)?;

    // every output directory must be created fresh, before any extraction
    for spec in specs {
        std::fs::create_dir(&spec.dir).map_err(|e| BackupError::PathIo {
            path: spec.dir.display().to_string(),
            source: e,
        })?;
    }

    let jobs = match opts.jobs {
        0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
        n => n,
    };
    // libgit2 handles must not be shared across threads; every worker gets
    // its own, opened up front
    let mut handles = Vec::with_capacity(jobs);
    for _ in 0..jobs {
        handles.push(backup.reopen()?);
    }

    let codec = NoncommitCodec::new();
    let errors = ErrorSink::new(cancel.clone());
    let (tx, rx) = channel::bounded::<PackRequest>(2 * jobs);

    std::thread::scope(|s| {
        for local in handles {
            let rx = rx.clone();
            let codec = codec.clone();
            let errors = &errors;
            s.spawn(move || {
                for req in rx.iter() {
                    if errors.cancelled() {
                        break;
                    }
                    if let Err(e) = extract_repo(&local, git, &codec, &req) {
                        errors.record(e);
                    }
                }
            });
        }
        drop(rx);

        // dispatcher: files first, then one pack request per repository
        let dispatched = (|| -> Result<()> {
            for spec in specs {
                errors.check()?;
                restore_files(backup, git, head, spec)?;

                for repo in &repov {
                    if !repo.path.starts_with(spec.prefix.as_bytes()) {
                        continue;
                    }
                    errors.check()?;
                    let dest = paths::from_prefix_path(&spec.prefix, &spec.dir, &repo.path)?;
                    let req = PackRequest {
                        repo: repo.clone(),
                        dest,
                    };
                    if tx.send(req).is_err() {
                        break; // all workers exited, cancellation in progress
                    }
                }
            }
            Ok(())
        })();
        if let Err(e) = dispatched {
            errors.record(e);
        }
        drop(tx); // close the channel; workers drain and exit
    });

    errors.into_result()
}

/// Extract every plain file under `H:<prefix>` into the output directory,
/// growing the `refs/{heads,tags}` and `objects/pack` skeleton for each
/// `*.git` directory seen. The skeleton is built here, while files are
/// restored, because a repository without references would otherwise never
/// be touched by the pack step and end up unrecognizable to git.
fn restore_files(backup: &Backup, git: &Git, head: Sha1, spec: &RestoreSpec) -> Result<()> {
    let lstree = git.output_raw(
        &[
            "ls-tree",
            "--full-tree",
            "-r",
            "-z",
            "--",
            &head.to_hex(),
            &spec.prefix,
        ],
        Run::default(),
    )?;

    let mut repos_seen: HashSet<PathBuf> = HashSet::new();
    for entry in lstree.split(|&b| b == 0) {
        if entry.is_empty() {
            continue; // after the final NUL
        }
        let (mode, kind, sha1, filename) = odb::parse_lstree_entry(entry)?;
        // `ls-tree -r` lists leaf objects only, and a backup tree holds no
        // submodules; anything but a blob means a corrupt backup
        if kind != ObjKind::Blob {
            return Err(BackupError::InvalidLstreeEntry(
                String::from_utf8_lossy(entry).into_owned(),
            ));
        }

        let out = paths::from_prefix_path(&spec.prefix, &spec.dir, &filename)?;
        info!("# file {}\t-> {}", spec.prefix, out.display());
        blob_to_file(backup, sha1, mode, &out)?;

        if let Some(dir) = out.parent() {
            if dir.file_name().is_some_and(paths::ends_with_git) && !repos_seen.contains(dir) {
                info!("# repo {}\t-> {}", spec.prefix, dir.display());
                make_repo_skeleton(dir)?;
                repos_seen.insert(dir.to_path_buf());
            }
        }
    }
    Ok(())
}

/// blob id + mode → file on disk, parent directories included.
fn blob_to_file(backup: &Backup, sha1: Sha1, mode: u32, path: &Path) -> Result<()> {
    let io = |e: std::io::Error| BackupError::PathIo {
        path: path.display().to_string(),
        source: e,
    };

    let content = backup.read_object(sha1, ObjKind::Blob)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }

    if mode == 0o120000 {
        #[cfg(unix)]
        std::os::unix::fs::symlink(paths::bytes_path(&content), path).map_err(io)?;
        #[cfg(not(unix))]
        std::fs::write(path, &content).map_err(io)?;
    } else {
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let perm = if mode == 0o100755 { 0o755 } else { 0o644 };
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(path)
                .map_err(io)?;
            f.write_all(&content).map_err(io)?;
        }
        #[cfg(not(unix))]
        std::fs::write(path, &content).map_err(io)?;
    }
    Ok(())
}

fn make_repo_skeleton(dir: &Path) -> Result<()> {
    for sub in ["refs/heads", "refs/tags", "objects/pack"] {
        std::fs::create_dir_all(dir.join(sub)).map_err(|e| BackupError::PathIo {
            path: dir.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}

/// Rebuild one repository: re-create decoded objects, generate its pack,
/// install its references, then prove the result sound.
fn extract_repo(backup: &Backup, git: &Git, codec: &NoncommitCodec, req: &PackRequest) -> Result<()> {
    let repo = &req.repo;
    let repodir = req.dest.display().to_string();
    info!("# git  {}\t-> {}", repo.path_lossy(), repodir);

    // Tag/tree/blob originals may have been pruned from the backup (they are
    // unreachable as themselves); re-create them from their encodings before
    // the pack walk needs them.
    for r in repo.refs.values() {
        if r.sha1 != r.repr {
            codec.recreate_from_commit(backup, r.repr)?;
        }
    }

    make_repo_skeleton(&req.dest)?;

    // pack all objects reachable from the repo's heads, out of the backup odb
    let heads = repo.sha1_heads_input();
    let pack_prefix = req.dest.join("objects/pack/pack");
    let pack_prefix = pack_prefix
        .to_str()
        .ok_or_else(|| BackupError::Other(format!("non-unicode restore path {repodir}")))?
        .to_string();
    // pack.threads=1: parallelism comes from the pool, not from inside a
    // single generation
    let mut argv = vec![
        "-c",
        "pack.threads=1",
        "pack-objects",
        "--revs",
        "--reuse-object",
        "--reuse-delta",
        "--delta-base-offset",
    ];
    if !git.progress() {
        argv.push("-q");
    }
    argv.push(&pack_prefix);
    git.check(
        &argv,
        Run {
            stdin: Some(heads.as_bytes()),
            progress_stderr: true,
            ..Run::default()
        },
    )?;

    // install the fetch-time reference snapshot
    let dest_git = git.for_repo(&req.dest);
    let mut batch = String::new();
    for (name, r) in &repo.refs {
        batch.push_str(&format!("update refs/{name} {}\n", r.sha1));
    }
    dest_git.check(
        &["update-ref", "--stdin"],
        Run {
            stdin: Some(batch.as_bytes()),
            ..Run::default()
        },
    )?;

    // the extracted repo's own view of its refs must match the manifest
    let listing = dest_git.output(
        &["for-each-ref", "--format=%(objectname) %(refname)"],
        Run::default(),
    )?;
    if listing != repo.expected_ref_listing() {
        return Err(BackupError::ExtractedRefsCorrupt(repodir));
    }

    // Connectivity from the heads inside the extracted repository proves the
    // pack holds every needed object. Unlike fsck this does not re-hash
    // object contents, which keeps it affordable per repository.
    let out = dest_git.run(
        &["rev-list", "--objects", "--stdin", "--quiet"],
        Run {
            stdin: Some(heads.as_bytes()),
            ..Run::default()
        },
    )?;
    if !out.status.success() {
        return Err(BackupError::ExtractedObjectsIncomplete(repodir));
    }

    Ok(())
}

// -------------------------------------------------------------------------
// First-error collection
// -------------------------------------------------------------------------

/// Keeps the first real error, logs the rest, and trips the shared
/// cancellation token on any of them.
struct ErrorSink {
    first: Mutex<Option<BackupError>>,
    cancel: CancelToken,
}

impl ErrorSink {
    fn new(cancel: CancelToken) -> ErrorSink {
        ErrorSink {
            first: Mutex::new(None),
            cancel,
        }
    }

    fn record(&self, e: BackupError) {
        self.cancel.cancel();
        if matches!(e, BackupError::Cancelled) {
            return; // a worker observing the token is not a new failure
        }
        let mut first = self.first.lock().unwrap();
        match &*first {
            None => *first = Some(e),
            Some(_) => warn!("additional error during restore: {e}"),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check(&self) -> Result<()> {
        self.cancel.check()
    }

    fn into_result(self) -> Result<()> {
        match self.first.into_inner().unwrap() {
            Some(e) => Err(e),
            // no worker failed; still surface an outside interruption
            None => self.cancel.check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_sink_keeps_first_and_cancels() {
        let cancel = CancelToken::new();
        let sink = ErrorSink::new(cancel.clone());
        assert!(sink.check().is_ok());

        sink.record(BackupError::Other("first".to_string()));
        sink.record(BackupError::Other("second".to_string()));
        assert!(cancel.is_cancelled());

        let err = sink.into_result().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn error_sink_suppresses_cancelled_echoes() {
        let cancel = CancelToken::new();
        let sink = ErrorSink::new(cancel.clone());
        sink.record(BackupError::Cancelled);
        // cancellation with no real failure still errors out as interrupted
        assert!(matches!(sink.into_result(), Err(BackupError::Cancelled)));
    }

    #[test]
    fn error_sink_clean_run() {
        let sink = ErrorSink::new(CancelToken::new());
        assert!(sink.into_result().is_ok());
    }
}
