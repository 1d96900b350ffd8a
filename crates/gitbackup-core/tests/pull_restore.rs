//! End-to-end pull → prune → restore round-trip against real repositories.
//!
//! Requires the `git` binary, like the engine itself does.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use tempfile::TempDir;

use gitbackup_core::encode::NoncommitCodec;
use gitbackup_core::index;
use gitbackup_core::odb::ObjKind;
use gitbackup_core::restore::RestoreOptions;
use gitbackup_core::sha1::Sha1;
use gitbackup_core::{pull, restore, Backup, CancelToken, Git, PullSpec, RestoreSpec};

/// Run `git --git-dir=<gitdir> <args>` and return trimmed stdout.
fn xgit(gitdir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("--git-dir")
        .arg(gitdir)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Ids created while building the source repository.
struct SourceRepo {
    commit2: Sha1,
    tree: Sha1,
    blob: Sha1,
    tag_commit: Sha1,
    tag_tag: Sha1,
    tag_blob: Sha1,
    tag_tree: Sha1,
}

fn write_raw_tag(repo: &git2::Repository, target: git2::Oid, kind: &str, name: &str) -> git2::Oid {
    let raw = format!(
        "object {target}\ntype {kind}\ntag {name}\n\
         tagger Test <test@example.org> 1234567890 +0000\n\ntest tag {name}\n"
    );
    repo.odb()
        .unwrap()
        .write(git2::ObjectType::Tag, raw.as_bytes())
        .unwrap()
}

/// A bare repository exercising every reference kind: branches, tag→commit,
/// tag→tag, tag→blob, tag→tree, and refs pointing straight at a tree/blob.
fn make_source_repo(path: &Path) -> SourceRepo {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let repo = git2::Repository::init_bare(path).unwrap();
    let sig =
        git2::Signature::new("Test", "test@example.org", &git2::Time::new(1234567890, 0)).unwrap();

    let blob = repo.blob(b"hello from the source repository\n").unwrap();
    let mut tb = repo.treebuilder(None).unwrap();
    tb.insert("file.txt", blob, 0o100644).unwrap();
    let tree_id = tb.write().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let c1 = repo
        .commit(Some("refs/heads/master"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    let c1_commit = repo.find_commit(c1).unwrap();
    let c2 = repo
        .commit(
            Some("refs/heads/master"),
            &sig,
            &sig,
            "second",
            &tree,
            &[&c1_commit],
        )
        .unwrap();
    repo.reference("refs/heads/feature", c1, true, "").unwrap();

    let tag_commit = write_raw_tag(&repo, c2, "commit", "v1");
    repo.reference("refs/tags/v1", tag_commit, true, "").unwrap();

    let tag_tag = write_raw_tag(&repo, tag_commit, "tag", "meta");
    repo.reference("refs/tags/meta", tag_tag, true, "").unwrap();

    let tag_blob = write_raw_tag(&repo, blob, "blob", "blobtag");
    repo.reference("refs/tags/blobtag", tag_blob, true, "").unwrap();

    let tag_tree = write_raw_tag(&repo, tree_id, "tree", "treetag");
    repo.reference("refs/tags/treetag", tag_tree, true, "").unwrap();

    repo.reference("refs/mix/tree", tree_id, true, "").unwrap();
    repo.reference("refs/mix/blob", blob, true, "").unwrap();

    SourceRepo {
        commit2: c2.into(),
        tree: tree_id.into(),
        blob: blob.into(),
        tag_commit: tag_commit.into(),
        tag_tag: tag_tag.into(),
        tag_blob: tag_blob.into(),
        tag_tree: tag_tree.into(),
    }
}

struct Setup {
    _tmp: TempDir,
    root: PathBuf,
    src: PathBuf,
    backup_dir: PathBuf,
    backup: Backup,
    git: Git,
    source: SourceRepo,
}

fn setup() -> Setup {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    // source tree: plain files + repositories
    let src = root.join("src");
    std::fs::create_dir_all(src.join("dir")).unwrap();
    std::fs::write(src.join("hello.txt"), b"hello world\n").unwrap();
    std::fs::write(src.join("dir/nested.txt"), b"nested\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let exe = src.join("run.sh");
        std::fs::write(&exe, b"#!/bin/sh\necho ok\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("hello.txt", src.join("link")).unwrap();
    }

    let source = make_source_repo(&src.join("kirr/repo1.git"));
    git2::Repository::init_bare(src.join("empty.git")).unwrap();

    // backup repository
    let backup_dir = root.join("backup.git");
    git2::Repository::init_bare(&backup_dir).unwrap();
    let backup = Backup::open(&backup_dir).unwrap();
    let git = Git::new(&backup_dir, false);

    Setup {
        _tmp: tmp,
        root,
        src,
        backup_dir,
        backup,
        git,
        source,
    }
}

fn pull_src(s: &Setup) {
    let specs = [PullSpec {
        dir: s.src.clone(),
        prefix: "b1".to_string(),
    }];
    pull(&s.backup, &s.git, &specs, &CancelToken::new()).unwrap();
}

fn backup_refs_text(s: &Setup) -> String {
    let head = s.backup.head_id().unwrap().unwrap();
    let blob = s.backup.blob_at(head, "backup.refs").unwrap().unwrap();
    String::from_utf8(blob).unwrap()
}

#[test]
fn pull_restore_roundtrip() {
    let s = setup();
    pull_src(&s);

    // ---- the manifest covers every source reference (P1), sorted (P5) ----
    let text = backup_refs_text(&s);
    let lines: Vec<&str> = text.lines().collect();
    let mut sorted = lines.clone();
    sorted.sort();
    assert_eq!(lines, sorted, "backup.refs lines must be byte-sorted");

    let repov = index::parse_backup_refs(&text).unwrap();
    let repo1 = repov
        .iter()
        .find(|r| r.path == b"b1/kirr/repo1.git")
        .expect("repo1 in manifest");
    for (name, sha1) in [
        ("heads/master", s.source.commit2),
        ("tags/v1", s.source.tag_commit),
        ("tags/meta", s.source.tag_tag),
        ("tags/blobtag", s.source.tag_blob),
        ("tags/treetag", s.source.tag_tree),
        ("mix/tree", s.source.tree),
        ("mix/blob", s.source.blob),
    ] {
        let r = repo1.refs.get(name).unwrap_or_else(|| panic!("missing {name}"));
        assert_eq!(r.sha1, sha1, "{name}");
    }
    assert!(repo1.refs.contains_key("heads/feature"));
    // the empty repository contributes no refs, but its files are backed up
    assert!(!repov.iter().any(|r| r.path == b"b1/empty.git"));
    assert!(text.contains("b1/kirr/repo1.git/heads/master"));

    // commit refs carry no encoding; non-commit refs do
    assert_eq!(repo1.refs["heads/master"].repr, repo1.refs["heads/master"].sha1);
    for name in ["tags/v1", "tags/meta", "tags/blobtag", "tags/treetag", "mix/tree", "mix/blob"] {
        assert_ne!(repo1.refs[name].repr, repo1.refs[name].sha1, "{name}");
    }

    // ---- head parents = previous head + sorted effective ids (P6) ----
    let head = s.backup.head_id().unwrap().unwrap();
    let info = s.backup.lookup_commit(head).unwrap();
    let effective: BTreeSet<Sha1> = repov
        .iter()
        .flat_map(|r| r.refs.values().map(|x| x.repr))
        .collect();
    assert_eq!(
        info.parents[1..],
        effective.iter().copied().collect::<Vec<_>>()[..],
    );

    // ---- encoding is deterministic and decodable (P2, P3, P4) ----
    for (orig, is_tag) in [
        (s.source.tag_commit, true),
        (s.source.tag_tag, true),
        (s.source.tag_blob, true),
        (s.source.tag_tree, true),
        (s.source.tree, false),
        (s.source.blob, false),
    ] {
        let repr = repo1
            .refs
            .values()
            .find(|r| r.sha1 == orig)
            .map(|r| r.repr)
            .unwrap();

        // fresh codecs must reproduce the id recorded at pull time
        let again = NoncommitCodec::new()
            .represent_as_commit(&s.backup, orig)
            .unwrap();
        assert_eq!(again, repr, "encode({orig}) unstable");

        let decoded = NoncommitCodec::new()
            .recreate_from_commit(&s.backup, repr)
            .unwrap();
        if is_tag {
            assert_eq!(decoded, orig, "decode(encode({orig}))");
        } else {
            assert!(decoded.is_null());
            // the object itself must be reachable from its encoding commit
            let objects = xgit(&s.backup_dir, &["rev-list", "--objects", &repr.to_hex()]);
            assert!(objects.contains(&orig.to_hex()), "{orig} not reachable from {repr}");
        }
    }

    // ---- work namespace is gone after the pull (S2) ----
    assert!(s
        .backup
        .reference_names_glob("refs/backup/*")
        .unwrap()
        .is_empty());
    assert!(!s.backup_dir.join("refs/backup").exists());

    // ---- a no-op pull produces an identical tree (P7) ----
    pull_src(&s);
    let head2 = s.backup.head_id().unwrap().unwrap();
    let info2 = s.backup.lookup_commit(head2).unwrap();
    assert_ne!(head2, head);
    assert_eq!(info2.parents[0], head);
    assert_eq!(info2.tree, info.tree, "no-op pull must not change the tree");
    assert_eq!(backup_refs_text(&s), text);

    // ---- prune the backup: pulled tag objects become unreachable (S3) ----
    xgit(&s.backup_dir, &["prune"]);
    xgit(&s.backup_dir, &["fsck"]);
    for tag in [s.source.tag_commit, s.source.tag_tag, s.source.tag_blob, s.source.tag_tree] {
        let gone = Command::new("git")
            .arg("--git-dir")
            .arg(&s.backup_dir)
            .args(["cat-file", "-e", &tag.to_hex()])
            .status()
            .unwrap();
        assert!(!gone.success(), "tag {tag} should be pruned");
    }

    // ---- restore and compare against the sources ----
    let out = s.root.join("restored");
    let specs = [RestoreSpec {
        prefix: "b1".to_string(),
        dir: out.clone(),
    }];
    restore(
        &s.backup,
        &s.git,
        "HEAD",
        &specs,
        &RestoreOptions { jobs: 2 },
        &CancelToken::new(),
    )
    .unwrap();

    // plain files
    assert_eq!(std::fs::read(out.join("hello.txt")).unwrap(), b"hello world\n");
    assert_eq!(std::fs::read(out.join("dir/nested.txt")).unwrap(), b"nested\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::symlink_metadata(out.join("run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "executable bit must survive");
        let link = std::fs::symlink_metadata(out.join("link")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(std::fs::read_link(out.join("link")).unwrap(), Path::new("hello.txt"));
    }

    // repositories: identical refs and identical object closures
    let orig = s.src.join("kirr/repo1.git");
    let rest = out.join("kirr/repo1.git");
    xgit(&rest, &["fsck"]);
    assert_eq!(
        xgit(&orig, &["for-each-ref"]),
        xgit(&rest, &["for-each-ref"]),
        "restored refs differ"
    );
    assert_eq!(
        xgit(&orig, &["rev-list", "--all", "--objects"]),
        xgit(&rest, &["rev-list", "--all", "--objects"]),
        "restored objects differ"
    );

    // the reference-less repository is still recognizable as one
    let empty = out.join("empty.git");
    assert!(empty.join("refs/heads").is_dir());
    assert!(empty.join("objects/pack").is_dir());

    // ---- restore + fresh pull of the restored output round-trips (P8) ----
    let backup2_dir = s.root.join("backup2.git");
    git2::Repository::init_bare(&backup2_dir).unwrap();
    let backup2 = Backup::open(&backup2_dir).unwrap();
    let git2_runner = Git::new(&backup2_dir, false);
    pull(
        &backup2,
        &git2_runner,
        &[PullSpec {
            dir: out.clone(),
            prefix: "b1".to_string(),
        }],
        &CancelToken::new(),
    )
    .unwrap();
    let head2 = backup2.head_id().unwrap().unwrap();
    let text2 = String::from_utf8(backup2.blob_at(head2, "backup.refs").unwrap().unwrap()).unwrap();
    assert_eq!(text2, text, "re-pull of restored output must reproduce backup.refs");
}

#[test]
fn noop_pull_after_prune_recreates_encoded_tags() {
    let s = setup();
    pull_src(&s);
    let head1 = s.backup.head_id().unwrap().unwrap();
    let tree1 = s.backup.lookup_commit(head1).unwrap().tree;
    let text1 = backup_refs_text(&s);

    // ordinary maintenance drops the unreachable tag originals
    xgit(&s.backup_dir, &["prune"]);
    let gone = Command::new("git")
        .arg("--git-dir")
        .arg(&s.backup_dir)
        .args(["cat-file", "-e", &s.source.tag_commit.to_hex()])
        .status()
        .unwrap();
    assert!(!gone.success(), "precondition: tag must be pruned");

    // an unchanged source must still produce an identical tree: the pull has
    // to write the pruned tags back from their encodings instead of trusting
    // the odb or re-fetching
    pull_src(&s);
    let head2 = s.backup.head_id().unwrap().unwrap();
    let info2 = s.backup.lookup_commit(head2).unwrap();
    assert_eq!(info2.parents[0], head1);
    assert_eq!(info2.tree, tree1);
    assert_eq!(backup_refs_text(&s), text1);

    // and the recreated tag is usable again
    xgit(
        &s.backup_dir,
        &["cat-file", "tag", &s.source.tag_commit.to_hex()],
    );
}

#[test]
fn incremental_pull_fetches_only_new_tips() {
    let s = setup();
    pull_src(&s);
    let head1 = s.backup.head_id().unwrap().unwrap();

    // grow the source by one commit
    let repo = git2::Repository::open(s.src.join("kirr/repo1.git")).unwrap();
    let sig =
        git2::Signature::new("Test", "test@example.org", &git2::Time::new(1234567999, 0)).unwrap();
    let head_ref = repo.find_reference("refs/heads/master").unwrap();
    let parent = head_ref.peel_to_commit().unwrap();
    let tree = parent.tree().unwrap();
    let c3 = repo
        .commit(Some("refs/heads/master"), &sig, &sig, "third", &tree, &[&parent])
        .unwrap();

    pull_src(&s);
    let text = backup_refs_text(&s);
    let repov = index::parse_backup_refs(&text).unwrap();
    let repo1 = repov.iter().find(|r| r.path == b"b1/kirr/repo1.git").unwrap();
    assert_eq!(repo1.refs["heads/master"].sha1, Sha1::from(c3));

    let head2 = s.backup.head_id().unwrap().unwrap();
    let info2 = s.backup.lookup_commit(head2).unwrap();
    assert_eq!(info2.parents[0], head1);
    assert!(info2.parents[1..].contains(&Sha1::from(c3)));
}

#[test]
fn corrupt_sender_aborts_pull_and_releases_lock() {
    let s = setup();
    pull_src(&s);
    let head_before = s.backup.head_id().unwrap().unwrap();

    // a source whose object store is corrupted under it
    let bad_src = s.root.join("src2");
    std::fs::create_dir_all(&bad_src).unwrap();
    make_source_repo(&bad_src.join("corrupt.git"));
    corrupt_one_loose_object(&bad_src.join("corrupt.git/objects"));

    let specs = [PullSpec {
        dir: bad_src,
        prefix: "b2".to_string(),
    }];
    let err = pull(&s.backup, &s.git, &specs, &CancelToken::new()).unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("corrupt.git"), "error should name the source: {rendered}");

    // head did not advance, the lock is released, no staging refs remain
    assert_eq!(s.backup.head_id().unwrap().unwrap(), head_before);
    assert!(s
        .backup
        .reference_names_glob("refs/backup.locked")
        .unwrap()
        .is_empty());
    assert!(s.backup.reference_names_glob("refs/backup/*").unwrap().is_empty());

    // and a subsequent good pull works again
    pull_src(&s);
}

/// Flip bytes in the middle of one loose object file.
fn corrupt_one_loose_object(objects: &Path) {
    for shard in std::fs::read_dir(objects).unwrap() {
        let shard = shard.unwrap();
        if shard.file_name().len() != 2 {
            continue; // info/, pack/
        }
        for obj in std::fs::read_dir(shard.path()).unwrap() {
            let obj = obj.unwrap();
            let mut data = std::fs::read(obj.path()).unwrap();
            if data.len() < 8 {
                continue;
            }
            let mid = data.len() / 2;
            let end = data.len().min(mid + 4);
            for b in &mut data[mid..end] {
                *b ^= 0xff;
            }
            // loose objects are written read-only
            let mut perms = std::fs::metadata(obj.path()).unwrap().permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(0o644);
            }
            std::fs::set_permissions(obj.path(), perms).unwrap();
            std::fs::write(obj.path(), &data).unwrap();
            return;
        }
    }
    panic!("no loose object found to corrupt");
}

#[test]
fn escaped_repository_names_roundtrip() {
    let s = setup();
    // a repository whose path needs escaping in reference names
    let spaced = s.src.join("tiwariayush/Discussion Forum .git");
    make_source_repo(&spaced);

    pull_src(&s);
    let text = backup_refs_text(&s);
    assert!(
        text.contains("b1/tiwariayush/Discussion%20Forum%20.git/heads/master"),
        "escaped path missing from manifest: {text}"
    );

    let repov = index::parse_backup_refs(&text).unwrap();
    assert!(repov
        .iter()
        .any(|r| r.path == b"b1/tiwariayush/Discussion Forum .git"));

    // restore brings the repository back under its unescaped name
    let out = s.root.join("restored-escaped");
    restore(
        &s.backup,
        &s.git,
        "HEAD",
        &[RestoreSpec {
            prefix: "b1".to_string(),
            dir: out.clone(),
        }],
        &RestoreOptions { jobs: 1 },
        &CancelToken::new(),
    )
    .unwrap();
    let rest = out.join("tiwariayush/Discussion Forum .git");
    assert_eq!(
        xgit(&spaced, &["for-each-ref"]),
        xgit(&rest, &["for-each-ref"])
    );
}

#[test]
fn restore_refuses_existing_output_directory() {
    let s = setup();
    pull_src(&s);

    let out = s.root.join("occupied");
    std::fs::create_dir(&out).unwrap();
    let err = restore(
        &s.backup,
        &s.git,
        "HEAD",
        &[RestoreSpec {
            prefix: "b1".to_string(),
            dir: out,
        }],
        &RestoreOptions::default(),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("occupied"));
}

#[test]
fn restore_rejects_duplicate_manifest_entries() {
    let s = setup();
    pull_src(&s);

    // hand-craft a state whose manifest repeats a ref
    let line = "1111111111111111111111111111111111111111 b1/a.git/heads/x";
    let bad = format!("{line}\n{line}");
    let blob = s
        .backup
        .write_object(bad.as_bytes(), ObjKind::Blob)
        .unwrap();
    let tree = {
        let repo = git2::Repository::open(&s.backup_dir).unwrap();
        let mut tb = repo.treebuilder(None).unwrap();
        tb.insert("backup.refs", blob.into(), 0o100644).unwrap();
        Sha1::from(tb.write().unwrap())
    };
    let commit = s
        .backup
        .commit_tree(tree, &[], b"bad state", None)
        .unwrap();

    let err = restore(
        &s.backup,
        &s.git,
        &commit.to_hex(),
        &[RestoreSpec {
            prefix: "b1".to_string(),
            dir: s.root.join("dup-out"),
        }],
        &RestoreOptions::default(),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(
        matches!(err, gitbackup_core::BackupError::DuplicateRef(_)),
        "{err}"
    );
}

#[test]
fn non_bare_backup_refreshes_its_working_copy() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let src = root.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("keep.txt"), b"keep\n").unwrap();
    std::fs::write(src.join("drop.txt"), b"drop\n").unwrap();

    let worktree = root.join("backup");
    git2::Repository::init(&worktree).unwrap();
    let backup = Backup::open(&worktree).unwrap();
    let git = Git::new(backup.git_path(), false);
    let specs = [PullSpec {
        dir: src.clone(),
        prefix: "b1".to_string(),
    }];

    pull(&backup, &git, &specs, &CancelToken::new()).unwrap();
    assert_eq!(
        std::fs::read(worktree.join("b1/keep.txt")).unwrap(),
        b"keep\n"
    );
    assert!(worktree.join("b1/drop.txt").exists());
    assert!(worktree.join("backup.refs").exists());

    // deletions must propagate to the working copy on the next pull
    std::fs::remove_file(src.join("drop.txt")).unwrap();
    pull(&backup, &git, &specs, &CancelToken::new()).unwrap();
    assert!(worktree.join("b1/keep.txt").exists());
    assert!(!worktree.join("b1/drop.txt").exists());
}

#[test]
fn fired_cancel_token_stops_pull_before_it_starts() {
    let s = setup();
    let cancel = CancelToken::new();
    cancel.cancel();

    let specs = [PullSpec {
        dir: s.src.clone(),
        prefix: "b1".to_string(),
    }];
    let err = pull(&s.backup, &s.git, &specs, &cancel).unwrap_err();
    assert!(matches!(err, gitbackup_core::BackupError::Cancelled));

    // the lock must not leak
    assert!(s
        .backup
        .reference_names_glob("refs/backup.locked")
        .unwrap()
        .is_empty());
    assert_eq!(s.backup.head_id().unwrap(), None);
}

#[test]
fn sha1_parse_matches_manifest_ids() {
    // guard against accidental widening of the id parser
    assert!(Sha1::from_str("4f2486e99ff9744751e0756b155e57bb24c453dd").is_ok());
    assert!(Sha1::from_str("4f2486e99ff9744751e0756b155e57bb24c453d").is_err());
}
