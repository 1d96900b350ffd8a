//! Incremental object fetch from one source repository.
//!
//! The planner advertises the source's references, diffs the tips against
//! what the backup provably already holds, transfers only the missing tips
//! (requested by raw id), and then proves the transfer complete with a
//! reachability walk that stops at everything already referenced. A sender
//! that omits reachable objects fails either the integrity check during
//! reception or this walk, never silently.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{BackupError, Result};
use crate::gitcmd::{Git, Run};
use crate::sha1::Sha1;

/// A reference advertised by a source repository, name without `refs/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRef {
    pub name: String,
    pub sha1: Sha1,
}

/// Make sure all objects reachable from `source`'s references are present in
/// the backup repository.
///
/// Returns every advertised reference and the subset of tips that actually
/// had to be transferred. `already_have` members are trusted to be present
/// with their full reachable closure.
pub fn fetch(
    git: &Git,
    source: &Path,
    already_have: &BTreeSet<Sha1>,
) -> Result<(Vec<RemoteRef>, Vec<Sha1>)> {
    fetch_inner(git, source, already_have).map_err(|e| match e {
        // already carries the source path
        e @ BackupError::IncompletePack(_) => e,
        e => e.for_repo(&source.display().to_string()),
    })
}

fn fetch_inner(
    git: &Git,
    source: &Path,
    already_have: &BTreeSet<Sha1>,
) -> Result<(Vec<RemoteRef>, Vec<Sha1>)> {
    let source_str = source
        .to_str()
        .ok_or_else(|| BackupError::Other(format!("non-unicode repo path {source:?}")))?;

    // advertise
    let advertised = git.output(&["ls-remote", "--", source_str, "refs/*"], Run::default())?;
    let refv = parse_ls_remote(&advertised)?;

    // diff against what we already have
    let missing: BTreeSet<Sha1> = refv
        .iter()
        .map(|r| r.sha1)
        .filter(|sha1| !already_have.contains(sha1))
        .collect();
    if missing.is_empty() {
        debug!("{}: all {} refs already present", source.display(), refv.len());
        return Ok((refv, Vec::new()));
    }

    let fetched: Vec<Sha1> = missing.into_iter().collect();
    info!(
        "fetching {} of {} tips from {}",
        fetched.len(),
        refv.len(),
        source.display()
    );

    // Transfer the missing tips, requested by id. fsck on reception makes a
    // corrupt pack fail the transfer. The upload-pack overrides let us want
    // arbitrary ids; older peers fall back to the tip/reachable variants.
    let mut wants = String::new();
    for sha1 in &fetched {
        wants.push_str(&sha1.to_hex());
        wants.push('\n');
    }
    git.check(
        &[
            "-c",
            "fetch.fsckObjects=true",
            "fetch-pack",
            "--thin",
            "--stdin",
            "--upload-pack=git -c uploadpack.allowAnySHA1InWant=true \
             -c uploadpack.allowTipSHA1InWant=true \
             -c uploadpack.allowReachableSHA1InWant=true upload-pack",
            source_str,
        ],
        Run {
            stdin: Some(wants.as_bytes()),
            progress_stderr: true,
            ..Run::default()
        },
    )?;

    // Completeness: walk from the just-fetched tips, stopping at every
    // reference the backup already has. A hole here means the sender passed
    // local validation but omitted objects the tips transitively need.
    let out = git.run(
        &["rev-list", "--objects", "--quiet", "--stdin", "--not", "--all"],
        Run {
            stdin: Some(wants.as_bytes()),
            ..Run::default()
        },
    )?;
    if !out.status.success() {
        return Err(BackupError::IncompletePack(source.display().to_string()));
    }

    Ok((refv, fetched))
}

/// Parse `ls-remote` output into references, dropping peeled-tag aliases and
/// stripping the `refs/` prefix.
fn parse_ls_remote(out: &str) -> Result<Vec<RemoteRef>> {
    let mut refv = Vec::new();
    for line in out.lines() {
        if line.is_empty() {
            continue;
        }
        let (sha1, name) = line
            .split_once('\t')
            .ok_or_else(|| BackupError::Other(format!("strange ls-remote entry {line:?}")))?;
        if name.ends_with("^{}") {
            continue; // peeled-tag dereference alias
        }
        let name = name
            .strip_prefix("refs/")
            .ok_or_else(|| BackupError::Other(format!("strange ls-remote entry {line:?}")))?;
        refv.push(RemoteRef {
            name: name.to_string(),
            sha1: sha1
                .parse()
                .map_err(|_| BackupError::Other(format!("strange ls-remote entry {line:?}")))?,
        });
    }
    Ok(refv)
}
