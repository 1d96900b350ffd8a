use crate::sha1::Sha1;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: {source}")]
    PathIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("git {cmd} failed: {stderr}")]
    GitCommand { cmd: String, stderr: String },

    #[error("invalid sha1 '{0}'")]
    Sha1Parse(String),

    #[error("{id}: type is {actual} (expected {expected})")]
    UnexpectedObjType {
        id: Sha1,
        actual: String,
        expected: String,
    },

    #[error("another git-backup is already running (lock {0} is held)")]
    Locked(String),

    #[error("fetching from '{repo}': {cause}")]
    Fetch {
        repo: String,
        #[source]
        cause: Box<BackupError>,
    },

    #[error("fetched pack from '{0}' is not complete")]
    IncompletePack(String),

    #[error("{id} ({kind}): cannot encode as commit")]
    CannotEncode { id: Sha1, kind: String },

    #[error("commit {commit}: {reason}")]
    RecreateObj { commit: Sha1, reason: String },

    #[error("tag {id}: invalid header")]
    TagParse { id: Sha1 },

    #[error("invalid backup.refs entry: {line:?}")]
    BadBackupRef { line: String },

    #[error("duplicate ref {0} in backup.refs")]
    DuplicateRef(String),

    #[error("'{0}' is not a ref of a git repository")]
    NotARepoRef(String),

    #[error("invalid ls-tree entry {0:?}")]
    InvalidLstreeEntry(String),

    #[error("extracted {0}: refs do not match backup.refs index")]
    ExtractedRefsCorrupt(String),

    #[error("extracted {0}: objects are not complete")]
    ExtractedObjectsIncomplete(String),

    #[error("{0:?}: invalid escape format")]
    Escape(String),

    #[error("interrupted")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    /// Wrap an error with the source repository it came from (fetch path).
    pub fn for_repo(self, repo: &str) -> BackupError {
        BackupError::Fetch {
            repo: repo.to_string(),
            cause: Box::new(self),
        }
    }
}
