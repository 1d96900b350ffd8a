//! Representation of tag/tree/blob objects as specially crafted commits.
//!
//! Backup merge commits carry every pulled tip in their parent list, but git
//! insists commit parents are commits. Tags (and refs pointing straight at
//! trees or blobs) are therefore encoded as synthetic commits on pull and
//! decoded back on restore. The original object is always attached to the
//! crafted commit one way or another, so it stays reachable through the
//! commit and only the tag object itself has to be re-created on restore.
//!
//! All crafted commits use a fixed identity and epoch timestamp, so the
//! transformation is stable across git environments, wall-clock time and
//! tool versions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{BackupError, Result};
use crate::odb::{parse_tag, Backup, Ident, ObjKind};
use crate::sha1::Sha1;

/// Encoder/decoder with a shared id-level memo.
///
/// The same tag object commonly appears in many forked repositories; the memo
/// collapses re-encoding work across them. Clones share the memo, so restore
/// workers hitting the same encoded id serialize through it.
#[derive(Clone, Default)]
pub struct NoncommitCodec {
    memo: Arc<Mutex<HashMap<Sha1, Sha1>>>,
}

impl NoncommitCodec {
    pub fn new() -> NoncommitCodec {
        NoncommitCodec::default()
    }

    /// Encode a tag/tree/blob object as a commit.
    ///
    /// Layout by the kind of the object reachable after one step of tag
    /// dereferencing:
    ///
    /// ```text
    /// Tag                ~>  Commit*
    ///  |                      .msg:      "tag\n" + tag bytes
    ///  v                      .tree   -> empty
    /// Commit                  .parent -> Commit
    ///
    /// Tag -> Tree             .tree   -> Tree,               .parent -> none
    /// Tag -> Blob             .tree   -> ("tagged" -> Blob), .parent -> none
    /// Tag2 -> Tag1            .tree   -> empty,              .parent -> encode(Tag1)
    /// ```
    ///
    /// A bare tree/blob ref encodes like the tag cases above with an empty
    /// message body.
    pub fn represent_as_commit(&self, backup: &Backup, sha1: Sha1) -> Result<Sha1> {
        if let Some(&repr) = self.memo.lock().unwrap().get(&sha1) {
            return Ok(repr);
        }

        let kind = backup.object_kind(sha1)?;
        let repr = self.represent_inner(backup, sha1, kind)?;

        self.memo.lock().unwrap().insert(sha1, repr);
        Ok(repr)
    }

    fn represent_inner(&self, backup: &Backup, sha1: Sha1, kind: ObjKind) -> Result<Sha1> {
        if kind == ObjKind::Commit {
            return Err(BackupError::CannotEncode {
                id: sha1,
                kind: kind.to_string(),
            });
        }

        // first line of the commit message = original object kind,
        // followed by the verbatim object bytes for tags
        let mut encoded = Vec::new();
        encoded.extend_from_slice(kind.as_str().as_bytes());
        encoded.push(b'\n');

        let (tagged_kind, tagged_sha1);
        if kind == ObjKind::Tag {
            let raw = backup.read_object(sha1, ObjKind::Tag)?;
            let tag = parse_tag(&raw).map_err(|_| BackupError::TagParse { id: sha1 })?;
            tagged_kind = tag.tagged_kind;
            tagged_sha1 = tag.tagged_sha1;
            encoded.extend_from_slice(&raw);
        } else {
            // for tree/blob we only care that the object stays reachable
            tagged_kind = kind;
            tagged_sha1 = sha1;
        }

        let fixed = Ident::fixed();
        let zcommit = |tree: Sha1, parents: &[Sha1]| {
            backup.commit_tree(tree, parents, &encoded, Some(&fixed))
        };

        match tagged_kind {
            ObjKind::Commit => zcommit(backup.empty_tree()?, &[tagged_sha1]),
            ObjKind::Tree => zcommit(tagged_sha1, &[]),
            ObjKind::Blob => zcommit(backup.tree_for_tagged_blob(tagged_sha1)?, &[]),
            ObjKind::Tag => {
                let inner = self.represent_as_commit(backup, tagged_sha1)?;
                zcommit(backup.empty_tree()?, &[inner])
            }
        }
    }

    /// Recreate a tag/tree/blob from its encoding commit.
    ///
    /// Trees and blobs need no work (they are attached to the commit and
    /// already present); the null id is returned for them. For tags the
    /// original tag object is written back, recursing through tag→tag
    /// chains, and the result is verified by re-encoding it.
    pub fn recreate_from_commit(&self, backup: &Backup, commit_sha1: Sha1) -> Result<Sha1> {
        let corrupt = |reason: &str| BackupError::RecreateObj {
            commit: commit_sha1,
            reason: reason.to_string(),
        };

        let commit = backup.lookup_commit(commit_sha1)?;
        if commit.parents.len() > 1 {
            return Err(corrupt(">1 parents"));
        }

        let nl = commit
            .message
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| corrupt("invalid encoded format"))?;
        let (kind_line, raw) = (&commit.message[..nl], &commit.message[nl + 1..]);
        let kind = std::str::from_utf8(kind_line)
            .ok()
            .and_then(ObjKind::from_token)
            .filter(|k| *k != ObjKind::Commit)
            .ok_or_else(|| {
                corrupt(&format!(
                    "unexpected encoded object type {:?}",
                    String::from_utf8_lossy(kind_line)
                ))
            })?;

        // trees and blobs were reachable from the commit all along
        if kind == ObjKind::Tree || kind == ObjKind::Blob {
            return Ok(Sha1::NULL);
        }

        // re-create the tag object
        let tag = parse_tag(raw).map_err(|_| corrupt("encoded tag: invalid header"))?;
        let tag_sha1 = backup.write_object(raw, ObjKind::Tag)?;

        // the tagged object is already in the repository because it was
        // attached to the encoding commit, except for tag→tag chains
        if tag.tagged_kind == ObjKind::Tag {
            match commit.parents.first() {
                Some(&parent) => {
                    self.recreate_from_commit(backup, parent)?;
                }
                None => {
                    return Err(corrupt("encoded tag corrupt (tagged is tag but no parent)"));
                }
            }
        }

        // verify consistency by re-encoding the recreated tag
        let reencoded = self.represent_as_commit(backup, tag_sha1)?;
        if reencoded != commit_sha1 {
            return Err(corrupt(&format!("encoded tag corrupt (reencoded as {reencoded})")));
        }

        Ok(tag_sha1)
    }
}
