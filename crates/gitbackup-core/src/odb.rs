//! Object-model adapter over libgit2.
//!
//! All reads go through [`Backup`] methods that copy data out of libgit2
//! buffers into owned values before returning. Values handed out by libgit2
//! alias memory owned by the underlying C objects; returning owned copies
//! makes use-after-free impossible at a copy cost that is negligible next to
//! subprocess alternatives. Do not add methods that return borrowed object
//! payloads.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::sha1::Sha1;

/// The four concrete object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjKind::Commit => "commit",
            ObjKind::Tree => "tree",
            ObjKind::Blob => "blob",
            ObjKind::Tag => "tag",
        }
    }

    pub fn from_token(token: &str) -> Option<ObjKind> {
        match token {
            "commit" => Some(ObjKind::Commit),
            "tree" => Some(ObjKind::Tree),
            "blob" => Some(ObjKind::Blob),
            "tag" => Some(ObjKind::Tag),
            _ => None,
        }
    }

    fn from_git2(t: git2::ObjectType) -> Option<ObjKind> {
        match t {
            git2::ObjectType::Commit => Some(ObjKind::Commit),
            git2::ObjectType::Tree => Some(ObjKind::Tree),
            git2::ObjectType::Blob => Some(ObjKind::Blob),
            git2::ObjectType::Tag => Some(ObjKind::Tag),
            _ => None,
        }
    }

    fn to_git2(self) -> git2::ObjectType {
        match self {
            ObjKind::Commit => git2::ObjectType::Commit,
            ObjKind::Tree => git2::ObjectType::Tree,
            ObjKind::Blob => git2::ObjectType::Blob,
            ObjKind::Tag => git2::ObjectType::Tag,
        }
    }
}

impl std::fmt::Display for ObjKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit fields needed by the engines, copied out of the object database.
#[derive(Debug)]
pub struct CommitInfo {
    pub tree: Sha1,
    pub parents: Vec<Sha1>,
    pub message: Vec<u8>,
}

/// An author/committer identity with a fixed timestamp.
#[derive(Clone, Debug)]
pub struct Ident {
    pub name: String,
    pub email: String,
    pub time: i64,
    pub tz_offset_min: i32,
}

impl Ident {
    /// The fixed identity used for every synthesized non-commit
    /// representation: independent of clock, environment and tool version,
    /// so encoding a given object always yields the same commit id.
    pub fn fixed() -> Ident {
        Ident {
            name: "Git backup".to_string(),
            email: "git@backup.org".to_string(),
            time: 0,
            tz_offset_min: 0,
        }
    }

    /// `name <email> time +hhmm` as it appears in commit headers.
    fn format(&self) -> String {
        let off = self.tz_offset_min;
        let sign = if off < 0 { '-' } else { '+' };
        let off = off.abs();
        format!(
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.time,
            sign,
            off / 60,
            off % 60
        )
    }
}

/// Parsed tag header.
#[derive(Debug, PartialEq, Eq)]
pub struct Tag {
    pub tagged_sha1: Sha1,
    pub tagged_kind: ObjKind,
}

/// Handle to the backup repository.
pub struct Backup {
    repo: git2::Repository,
    empty_tree: OnceCell<Sha1>,
}

impl Backup {
    pub fn open(path: &Path) -> Result<Backup> {
        Ok(Backup {
            repo: git2::Repository::open(path)?,
            empty_tree: OnceCell::new(),
        })
    }

    /// Open the backup repository the way git itself would: from `$GIT_DIR`
    /// or by discovering upward from the current directory.
    pub fn open_from_env() -> Result<Backup> {
        Ok(Backup {
            repo: git2::Repository::open_from_env()?,
            empty_tree: OnceCell::new(),
        })
    }

    /// A second independent handle to the same repository.
    ///
    /// libgit2 handles must not be shared across threads; restore workers
    /// each reopen their own.
    pub fn reopen(&self) -> Result<Backup> {
        Backup::open(self.repo.path())
    }

    /// Path of the repository itself (the `.git` directory for non-bare).
    pub fn git_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    pub fn is_bare(&self) -> bool {
        self.repo.is_bare()
    }

    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(Path::to_path_buf)
    }

    // ---------------------------------------------------------------------
    // Raw objects
    // ---------------------------------------------------------------------

    /// Read an object's canonical bytes, checking its kind.
    pub fn read_object(&self, sha1: Sha1, kind: ObjKind) -> Result<Vec<u8>> {
        let odb = self.repo.odb()?;
        let obj = odb.read(sha1.into())?;
        match ObjKind::from_git2(obj.kind()) {
            Some(k) if k == kind => Ok(obj.data().to_vec()),
            other => Err(BackupError::UnexpectedObjType {
                id: sha1,
                actual: other.map_or_else(|| "unknown".to_string(), |k| k.to_string()),
                expected: kind.to_string(),
            }),
        }
    }

    /// Object kind from the header alone (no payload inflation).
    pub fn object_kind(&self, sha1: Sha1) -> Result<ObjKind> {
        let odb = self.repo.odb()?;
        let (_, t) = odb.read_header(sha1.into())?;
        ObjKind::from_git2(t).ok_or_else(|| BackupError::UnexpectedObjType {
            id: sha1,
            actual: format!("{t:?}"),
            expected: "commit|tree|blob|tag".to_string(),
        })
    }

    pub fn write_object(&self, data: &[u8], kind: ObjKind) -> Result<Sha1> {
        let odb = self.repo.odb()?;
        Ok(odb.write(kind.to_git2(), data)?.into())
    }

    // ---------------------------------------------------------------------
    // Commits and trees
    // ---------------------------------------------------------------------

    pub fn lookup_commit(&self, sha1: Sha1) -> Result<CommitInfo> {
        let commit = self.repo.find_commit(sha1.into())?;
        Ok(CommitInfo {
            tree: commit.tree_id().into(),
            parents: commit.parent_ids().map(Sha1::from).collect(),
            message: commit.message_raw_bytes().to_vec(),
        })
    }

    /// The canonical empty tree, written once per handle and cached.
    pub fn empty_tree(&self) -> Result<Sha1> {
        if let Some(&sha1) = self.empty_tree.get() {
            return Ok(sha1);
        }
        let mut tb = self.repo.treebuilder(None)?;
        let sha1: Sha1 = tb.write()?.into();
        let _ = self.empty_tree.set(sha1);
        Ok(sha1)
    }

    /// One-entry tree holding `blob` under the filename `tagged` (100644),
    /// used to keep a tagged blob reachable from its encoding commit.
    pub fn tree_for_tagged_blob(&self, blob: Sha1) -> Result<Sha1> {
        let mut tb = self.repo.treebuilder(None)?;
        tb.insert("tagged", blob.into(), 0o100644)?;
        Ok(tb.write()?.into())
    }

    /// Synthesize a commit from its fields.
    ///
    /// The canonical byte form is assembled here and written through the
    /// object database, which keeps the id a pure function of the inputs
    /// and lets the message carry arbitrary bytes. `ident: None` commits
    /// with the repository's configured identity (falling back to a
    /// generated one, as `git commit-tree` does).
    pub fn commit_tree(
        &self,
        tree: Sha1,
        parents: &[Sha1],
        message: &[u8],
        ident: Option<&Ident>,
    ) -> Result<Sha1> {
        let default_ident;
        let ident = match ident {
            Some(i) => i,
            None => {
                default_ident = self.default_ident()?;
                &default_ident
            }
        };

        let mut buf = Vec::with_capacity(message.len() + 256);
        buf.extend_from_slice(format!("tree {tree}\n").as_bytes());
        for p in parents {
            buf.extend_from_slice(format!("parent {p}\n").as_bytes());
        }
        let who = ident.format();
        buf.extend_from_slice(format!("author {who}\ncommitter {who}\n\n").as_bytes());
        buf.extend_from_slice(message);

        self.write_object(&buf, ObjKind::Commit)
    }

    fn default_ident(&self) -> Result<Ident> {
        let sig = match self.repo.signature() {
            Ok(sig) => sig,
            // no user.name/user.email configured: generate one, like git does
            Err(_) => git2::Signature::now("git-backup", "git-backup@localhost")?,
        };
        Ok(Ident {
            name: sig.name().unwrap_or("git-backup").to_string(),
            email: sig.email().unwrap_or("git-backup@localhost").to_string(),
            time: sig.when().seconds(),
            tz_offset_min: sig.when().offset_minutes(),
        })
    }

    // ---------------------------------------------------------------------
    // References and history
    // ---------------------------------------------------------------------

    /// Commit id of HEAD, or `None` for a freshly initialized repository.
    pub fn head_id(&self) -> Result<Option<Sha1>> {
        match self.repo.head() {
            Ok(head) => Ok(head.target().map(Sha1::from)),
            Err(e)
                if e.code() == git2::ErrorCode::UnbornBranch
                    || e.code() == git2::ErrorCode::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All commit ids reachable from `head`.
    pub fn reachable_commits(&self, head: Sha1) -> Result<std::collections::BTreeSet<Sha1>> {
        let mut walk = self.repo.revwalk()?;
        walk.push(head.into())?;
        let mut out = std::collections::BTreeSet::new();
        for oid in walk {
            out.insert(Sha1::from(oid?));
        }
        Ok(out)
    }

    /// Resolve a commit-ish expression to a commit id.
    pub fn revparse_commit(&self, spec: &str) -> Result<Sha1> {
        let obj = self.repo.revparse_single(spec)?;
        Ok(obj.peel(git2::ObjectType::Commit)?.id().into())
    }

    /// Blob content at `<commit>:<name>` (top-level tree entry), or `None`
    /// when the commit's tree has no such entry.
    pub fn blob_at(&self, commit: Sha1, name: &str) -> Result<Option<Vec<u8>>> {
        let Some((sha1, kind)) = self.tree_entry_by_name(self.lookup_commit(commit)?.tree, name)?
        else {
            return Ok(None);
        };
        if kind != ObjKind::Blob {
            return Err(BackupError::UnexpectedObjType {
                id: sha1,
                actual: kind.to_string(),
                expected: ObjKind::Blob.to_string(),
            });
        }
        self.read_object(sha1, ObjKind::Blob).map(Some)
    }

    /// Entry `name` of `tree`, as owned values.
    pub fn tree_entry_by_name(&self, tree: Sha1, name: &str) -> Result<Option<(Sha1, ObjKind)>> {
        let tree = self.repo.find_tree(tree.into())?;
        let result = match tree.get_name(name) {
            None => Ok(None),
            Some(entry) => {
                let sha1 = Sha1::from(entry.id());
                let kind = entry
                    .kind()
                    .and_then(ObjKind::from_git2)
                    .ok_or_else(|| BackupError::Other(format!("{sha1}: strange tree entry kind")))?;
                Ok(Some((sha1, kind)))
            }
        };
        result
    }

    /// Create a reference; `Exists` maps to the locking error since the only
    /// non-forcing creation we do is the exclusion token.
    pub fn reference_create(&self, name: &str, target: Sha1, log_message: &str) -> Result<()> {
        match self.repo.reference(name, target.into(), false, log_message) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == git2::ErrorCode::Exists => {
                Err(BackupError::Locked(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn reference_delete(&self, name: &str) -> Result<()> {
        let mut r = self.repo.find_reference(name)?;
        r.delete()?;
        Ok(())
    }

    /// Names of all references matching a glob pattern, sorted.
    pub fn reference_names_glob(&self, glob: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for r in self.repo.references_glob(glob)? {
            let r = r?;
            if let Some(name) = r.name() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn index(&self) -> Result<git2::Index> {
        Ok(self.repo.index()?)
    }

    /// Write the index out as a tree.
    pub fn write_index_tree(&self, index: &mut git2::Index) -> Result<Sha1> {
        index.write()?;
        Ok(index.write_tree()?.into())
    }
}

// -------------------------------------------------------------------------
// Parsers
// -------------------------------------------------------------------------

/// Parse a raw tag object's `object`/`type` header.
pub fn parse_tag(raw: &[u8]) -> Result<Tag> {
    let invalid = || BackupError::Other("tag: invalid header".to_string());

    let mut lines = raw.split(|&b| b == b'\n');
    let object = lines.next().ok_or_else(invalid)?;
    let type_ = lines.next().ok_or_else(invalid)?;

    let object = std::str::from_utf8(object).map_err(|_| invalid())?;
    let type_ = std::str::from_utf8(type_).map_err(|_| invalid())?;

    let sha1 = object
        .strip_prefix("object ")
        .ok_or_else(invalid)?
        .parse::<Sha1>()
        .map_err(|_| invalid())?;
    let kind = type_
        .strip_prefix("type ")
        .and_then(ObjKind::from_token)
        .ok_or_else(invalid)?;

    Ok(Tag {
        tagged_sha1: sha1,
        tagged_kind: kind,
    })
}

/// Parse one NUL-terminated `ls-tree -r -z` entry:
/// `<mode> SP <type> SP <object> TAB <file>` (the file part may contain
/// spaces and arbitrary bytes).
pub fn parse_lstree_entry(entry: &[u8]) -> Result<(u32, ObjKind, Sha1, Vec<u8>)> {
    let invalid = || BackupError::InvalidLstreeEntry(String::from_utf8_lossy(entry).into_owned());

    let tab = entry.iter().position(|&b| b == b'\t').ok_or_else(invalid)?;
    let head = std::str::from_utf8(&entry[..tab]).map_err(|_| invalid())?;
    let filename = entry[tab + 1..].to_vec();

    let mut fields = head.split_ascii_whitespace();
    let mode = fields
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(invalid)?;
    let kind = fields
        .next()
        .and_then(ObjKind::from_token)
        .ok_or_else(invalid)?;
    let sha1 = fields
        .next()
        .and_then(|s| s.parse::<Sha1>().ok())
        .ok_or_else(invalid)?;
    if fields.next().is_some() {
        return Err(invalid());
    }

    Ok((mode, kind, sha1, filename))
}
