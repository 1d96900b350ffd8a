//! The `backup.refs` manifest.
//!
//! One line per source reference:
//!
//! ```text
//! 1eeb0324... <prefix>/wendelin.core.git/heads/master
//! 213a9243... <prefix>/wendelin.core.git/tags/v0.4 <213a9243-encoded-as-commit>
//! ```
//!
//! The second field is the escaped repository path joined with the reference
//! name (without `refs/`). The third field is present when the original
//! object is not a commit and holds the id of its commit encoding. Lines are
//! sorted by raw byte comparison, which keeps the blob stable between runs.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{BackupError, Result};
use crate::refname;
use crate::sha1::Sha1;

/// Ids recorded for one reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefSha1 {
    /// What the ref pointed to in the source repository.
    pub sha1: Sha1,
    /// What represents that object in the backup: the same id for commits,
    /// the encoding commit id otherwise.
    pub repr: Sha1,
}

/// One source repository's slice of the index.
#[derive(Clone, Debug, Default)]
pub struct BackupRepo {
    /// Unescaped repository path including the backup prefix, e.g.
    /// `b1/kirr/wendelin.core.git`.
    pub path: Vec<u8>,
    /// refname (without `refs/`) → ids, iterated in refname order.
    pub refs: BTreeMap<String, RefSha1>,
}

impl BackupRepo {
    pub fn path_lossy(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }

    /// Sorted unique original head ids.
    pub fn sha1_heads(&self) -> Vec<Sha1> {
        let set: std::collections::BTreeSet<Sha1> =
            self.refs.values().map(|r| r.sha1).collect();
        set.into_iter().collect()
    }

    /// Heads in text form, one per line, for feeding rev list plumbing.
    pub fn sha1_heads_input(&self) -> String {
        let mut s = String::new();
        for sha1 in self.sha1_heads() {
            s.push_str(&sha1.to_hex());
            s.push('\n');
        }
        s
    }

    /// `<sha1> refs/<refname>` lines sorted by refname, the layout
    /// `for-each-ref` reports, for verifying an extracted repository.
    pub fn expected_ref_listing(&self) -> String {
        let mut lines = Vec::with_capacity(self.refs.len());
        for (name, r) in &self.refs {
            lines.push(format!("{} refs/{}", r.sha1, name));
        }
        lines.join("\n")
    }
}

/// Format one index line.
pub fn format_line(sha1: Sha1, refstring: &str, repr: Option<Sha1>) -> String {
    match repr {
        Some(repr) => format!("{sha1} {refstring} {repr}"),
        None => format!("{sha1} {refstring}"),
    }
}

/// Split `kirr/wendelin.core.git/heads/master` into the unescaped repository
/// path `kirr/wendelin.core.git` and the reference `heads/master`. The
/// repository path is the longest prefix ending in `.git`.
pub fn reporef_split(reporef: &str) -> Result<(Vec<u8>, String)> {
    let dotgit = reporef
        .rfind(".git/")
        .ok_or_else(|| BackupError::NotARepoRef(reporef.to_string()))?;
    let (repo, rest) = reporef.split_at(dotgit + ".git".len());
    let repo = refname::unescape_path(repo)?;
    Ok((repo, rest[1..].to_string()))
}

/// Parse a `backup.refs` blob into repositories sorted by path.
pub fn parse_backup_refs(text: &str) -> Result<Vec<BackupRepo>> {
    let mut repotab: BTreeMap<Vec<u8>, BackupRepo> = BTreeMap::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let bad = || BackupError::BadBackupRef {
            line: line.to_string(),
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(2..=3).contains(&fields.len()) {
            return Err(bad());
        }
        let sha1 = Sha1::from_str(fields[0]).map_err(|_| bad())?;
        let repr = match fields.get(2) {
            Some(f) => Sha1::from_str(f).map_err(|_| bad())?,
            None => sha1,
        };
        let reporef = fields[1];
        let (repopath, refname) = reporef_split(reporef)?;

        let repo = repotab.entry(repopath.clone()).or_insert_with(|| BackupRepo {
            path: repopath,
            ..BackupRepo::default()
        });
        if repo
            .refs
            .insert(refname, RefSha1 { sha1, repr })
            .is_some()
        {
            return Err(BackupError::DuplicateRef(reporef.to_string()));
        }
    }

    Ok(repotab.into_values().collect())
}
