mod signal;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use gitbackup_core::restore::RestoreOptions;
use gitbackup_core::{pull, restore, Backup, CancelToken, Git, PullSpec, RestoreSpec};

#[derive(Parser)]
#[command(
    name = "git-backup",
    version,
    about = "Backup set of git repositories & just files; efficiently",
    after_help = "\
The backup repository is the repository of the current directory (or
$GIT_DIR), like for any other git command.

Examples:
  git-backup pull /srv/repos:hosted /etc:etc
  git-backup restore HEAD~3 hosted:/srv/repos.restored"
)]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease verbosity (repeatable)
    #[arg(short = 'q', action = ArgAction::Count, global = true)]
    quiet: u8,

    /// Worker count for restore pack extraction (default: logical CPUs)
    #[arg(short = 'j', long = "jobs", global = true, value_name = "N")]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull git repositories and files into the backup
    Pull {
        /// One or more <dir>:<prefix> pairs
        #[arg(required = true, value_name = "DIR:PREFIX")]
        specs: Vec<String>,
    },
    /// Restore git repositories and files from a backup state
    Restore {
        /// Backup state to restore from (commit-ish)
        #[arg(value_name = "COMMIT-ISH")]
        commit: String,

        /// One or more <prefix>:<dir> pairs
        #[arg(required = true, value_name = "PREFIX:DIR")]
        specs: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap would exit 2 on usage errors; we keep 0/1 semantics
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS // -h / --version
            };
        }
    };

    // verbosity: 0 silent-ish, 1 info (default), 2 progress+debug, 3 trace
    let verbosity = 1 + cli.verbose as i32 - cli.quiet as i32;
    let filter = match verbosity {
        i32::MIN..=0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match run(cli, verbosity) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("E: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, verbosity: i32) -> Result<(), Box<dyn std::error::Error>> {
    let backup = Backup::open_from_env()?;
    let git = Git::new(backup.git_path(), verbosity >= 2);
    let cancel = CancelToken::new();
    signal::install(&cancel);

    match cli.command {
        Commands::Pull { specs } => {
            let specs = specs
                .iter()
                .map(|s| {
                    let (dir, prefix) = split2(s)?;
                    Ok(PullSpec {
                        dir: PathBuf::from(dir),
                        prefix: prefix.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, String>>()?;
            pull(&backup, &git, &specs, &cancel)?;
        }
        Commands::Restore { commit, specs } => {
            let specs = specs
                .iter()
                .map(|s| {
                    let (prefix, dir) = split2(s)?;
                    Ok(RestoreSpec {
                        prefix: prefix.to_string(),
                        dir: PathBuf::from(dir),
                    })
                })
                .collect::<Result<Vec<_>, String>>()?;
            let opts = RestoreOptions {
                jobs: cli.jobs.unwrap_or(0),
            };
            restore(&backup, &git, &commit, &specs, &opts, &cancel)?;
        }
    }
    Ok(())
}

/// Split a spec on its single `:`.
fn split2(s: &str) -> Result<(&str, &str), String> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(format!("invalid spec {s:?} (expected one ':')")),
    }
}
