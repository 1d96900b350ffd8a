//! Shared helpers for unit tests: scratch repositories and objects.

use tempfile::TempDir;

use crate::odb::{Backup, Ident, ObjKind};
use crate::sha1::Sha1;

/// Fresh bare repository in a tempdir, opened as a backup handle.
pub fn init_bare_backup() -> (TempDir, Backup) {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("backup.git");
    git2::Repository::init_bare(&path).expect("init bare repository");
    let backup = Backup::open(&path).expect("open backup");
    (tmp, backup)
}

/// Write an annotated tag object for `target` with a fixed tagger, returning
/// its id and raw bytes.
pub fn write_tag(backup: &Backup, target: Sha1, kind: ObjKind, name: &str) -> (Sha1, Vec<u8>) {
    let ident = Ident::fixed();
    let raw = format!(
        "object {target}\ntype {kind}\ntag {name}\ntagger {} <{}> {} +0000\n\ntest tag {name}\n",
        ident.name, ident.email, ident.time
    )
    .into_bytes();
    let sha1 = backup.write_object(&raw, ObjKind::Tag).expect("write tag");
    (sha1, raw)
}
