use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use chorus_core::domain::TaskState;

#[derive(Parser, Debug)]
#[command(name = "chorus", version, about = "Durable inference queue for long audio recordings")]
pub struct Cli {
    /// SQLite database holding the queue.
    #[arg(long, global = true, env = "CHORUS_DB", default_value = "chorus.db")]
    pub db: PathBuf,

    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true, env = "CHORUS_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue every subject a selector matches for one config.
    Enqueue {
        #[arg(long)]
        config: String,
        #[arg(long)]
        selector: String,
        #[arg(long, env = "CHORUS_SELECTORS", default_value = "selectors.toml")]
        catalog: PathBuf,
        /// Free-form label stored on the new tasks.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Start the producer and the worker pool.
    Run(RunArgs),

    /// Delete every task that is not running or done, with its results.
    ResetQueue,

    /// Return every FAILED task to PENDING.
    ResetFailed,

    /// Task counts per state.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List tasks, oldest first.
    Tasks {
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },

    /// Store a JSON config and print its id.
    StoreConfig {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Print a stored config as JSON.
    ShowConfig {
        #[arg(long)]
        id: String,
    },

    /// Register subjects from a JSON-lines file.
    ImportSubjects {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, env = "CHORUS_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Directory the subjects' object names are relative to.
    #[arg(long, env = "CHORUS_MEDIA_ROOT")]
    pub media_root: PathBuf,

    /// Model manifest (TOML).
    #[arg(long, env = "CHORUS_MODEL")]
    pub model: PathBuf,

    /// Seconds to wait between claims while the queue is empty.
    #[arg(
        long = "idle-secs",
        env = "CHORUS_IDLE_SECS",
        default_value = "10",
        value_parser = parse_duration
    )]
    pub idle: Duration,

    /// Exit once the queue is empty and the queued work is done.
    #[arg(long)]
    pub once: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateArg {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl From<StateArg> for TaskState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Pending => TaskState::Pending,
            StateArg::InProgress => TaskState::InProgress,
            StateArg::Done => TaskState::Done,
            StateArg::Failed => TaskState::Failed,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from([
            "chorus", "--db", "q.db", "run", "--media-root", "/data", "--model", "m.toml",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, 1);
        assert_eq!(args.idle, Duration::from_secs(10));
        assert!(!args.once);
        assert_eq!(cli.db, PathBuf::from("q.db"));
    }

    #[test]
    fn enqueue_requires_config_and_selector() {
        assert!(Cli::try_parse_from(["chorus", "enqueue", "--config", "abc"]).is_err());
        let cli = Cli::try_parse_from([
            "chorus", "enqueue", "--config", "abc", "--selector", "all",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Enqueue { .. }));
    }

    #[test]
    fn task_state_filter_uses_kebab_case() {
        let cli = Cli::try_parse_from(["chorus", "tasks", "--state", "in-progress"]).unwrap();

        let Command::Tasks { state } = cli.command else {
            panic!("expected tasks");
        };
        assert_eq!(state.map(TaskState::from), Some(TaskState::InProgress));
    }
}
