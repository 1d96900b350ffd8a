//! Running git subprocesses.
//!
//! libgit2 covers the object database, but transfer and pack plumbing
//! (`ls-remote`, `fetch-pack`, `pack-objects`, `rev-list --objects`,
//! batched `update-ref --stdin`, `ls-tree`, `diff`/`apply`) is driven
//! through the real git binary, which is what defines those behaviors in
//! the first place.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::{BackupError, Result};

/// Runner bound to one repository (`--git-dir`).
#[derive(Clone, Debug)]
pub struct Git {
    git_dir: PathBuf,
    /// Let long-running subcommands write progress to our stderr instead of
    /// capturing it.
    progress: bool,
}

/// Per-invocation options.
#[derive(Default)]
pub struct Run<'a> {
    pub stdin: Option<&'a [u8]>,
    /// Pass stderr through to the terminal when the runner has progress
    /// enabled (fetch/pack transfer progress).
    pub progress_stderr: bool,
    pub current_dir: Option<&'a Path>,
}

impl Git {
    pub fn new(git_dir: impl Into<PathBuf>, progress: bool) -> Git {
        Git {
            git_dir: git_dir.into(),
            progress,
        }
    }

    /// Runner for another repository with the same settings.
    pub fn for_repo(&self, git_dir: impl Into<PathBuf>) -> Git {
        Git {
            git_dir: git_dir.into(),
            progress: self.progress,
        }
    }

    /// Whether subprocess progress output is being passed through.
    pub fn progress(&self) -> bool {
        self.progress
    }

    /// Spawn `git *argv` and collect its output. An unsuccessful exit status
    /// is *not* an error here; callers that require success use the
    /// wrappers below.
    pub fn run(&self, argv: &[&str], run: Run<'_>) -> Result<Output> {
        debug!("git {}", argv.join(" "));

        let mut cmd = Command::new("git");
        cmd.arg("--git-dir").arg(&self.git_dir);
        cmd.args(argv);
        if let Some(dir) = run.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if run.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(if run.progress_stderr && self.progress {
            Stdio::inherit()
        } else {
            Stdio::piped()
        });

        let mut child = cmd.spawn().map_err(|e| BackupError::PathIo {
            path: "git".to_string(),
            source: e,
        })?;

        // Feed stdin from a helper thread so a child filling its stdout pipe
        // cannot deadlock against us still writing.
        let feeder = match run.stdin {
            Some(data) => {
                let mut stdin = child.stdin.take().expect("stdin was piped");
                let data = data.to_vec();
                Some(std::thread::spawn(move || {
                    // a child that stops reading early (failure) breaks the
                    // pipe; its exit status is the signal we act on
                    let _ = stdin.write_all(&data);
                }))
            }
            None => None,
        };

        let output = child.wait_with_output();
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }
        Ok(output?)
    }

    /// Run and require success, returning whitespace-trimmed stdout.
    pub fn output(&self, argv: &[&str], run: Run<'_>) -> Result<String> {
        let out = self.run_ok(argv, run)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Run and require success, returning raw stdout bytes.
    pub fn output_raw(&self, argv: &[&str], run: Run<'_>) -> Result<Vec<u8>> {
        Ok(self.run_ok(argv, run)?.stdout)
    }

    /// Run and require success, discarding stdout.
    pub fn check(&self, argv: &[&str], run: Run<'_>) -> Result<()> {
        self.run_ok(argv, run).map(|_| ())
    }

    fn run_ok(&self, argv: &[&str], run: Run<'_>) -> Result<Output> {
        let out = self.run(argv, run)?;
        if !out.status.success() {
            return Err(self.command_error(
                argv,
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(out)
    }

    fn command_error(&self, argv: &[&str], stderr: String) -> BackupError {
        BackupError::GitCommand {
            cmd: argv.join(" "),
            stderr,
        }
    }
}
