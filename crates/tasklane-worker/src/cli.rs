//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tasklane_jobs::ConsumeOptions;

#[derive(Debug, Parser)]
#[command(name = "tasklane-worker")]
#[command(version)]
#[command(about = "Run and operate tasklane job workers", long_about = None)]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, env = "TASKLANE_CONFIG_DIR", default_value = "./config", global = true)]
    pub config_dir: String,

    /// Run every job dispatched by this process inline
    #[arg(long, global = true)]
    pub sync: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume jobs until interrupted
    Work(WorkArgs),

    /// Move failed jobs back to pending
    Retry(TargetArgs),

    /// Print job counts per status as JSON
    Stats {
        /// Only count jobs on this queue
        #[arg(short, long)]
        queue: Option<String>,
    },
}

/// Driver and queue selection.
#[derive(Debug, Clone, Default, Args)]
pub struct TargetArgs {
    /// Driver name; the configured default when omitted
    #[arg(short, long)]
    pub driver: Option<String>,

    /// Queue name; the driver's configured queue when omitted
    #[arg(short, long)]
    pub queue: Option<String>,
}

impl TargetArgs {
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            queue: self.queue.clone(),
            ..ConsumeOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct WorkArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Sleep between empty polls in milliseconds
    #[arg(long)]
    pub poll_ms: Option<u64>,

    /// Jobs reserved per poll
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Attempt budget per job
    #[arg(long)]
    pub attempts: Option<u32>,
}

impl WorkArgs {
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            queue: self.target.queue.clone(),
            poll_interval: self.poll_ms.map(Duration::from_millis),
            batch_size: self.batch_size,
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_work() {
        let cli = Cli::try_parse_from([
            "tasklane-worker",
            "work",
            "--driver",
            "redis",
            "--queue",
            "emails",
            "--poll-ms",
            "250",
            "--sync",
        ])
        .unwrap();

        assert!(cli.sync);
        assert_eq!(cli.config_dir, "./config");
        let Command::Work(args) = cli.command else {
            panic!("expected work command");
        };
        assert_eq!(args.target.driver.as_deref(), Some("redis"));
        let options = args.consume_options();
        assert_eq!(options.queue.as_deref(), Some("emails"));
        assert_eq!(options.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(options.batch_size, None);
    }

    #[test]
    fn test_parse_retry_and_stats() {
        let cli = Cli::try_parse_from(["tasklane-worker", "--config-dir", "/etc/tasklane", "retry", "-d", "database"])
            .unwrap();
        assert_eq!(cli.config_dir, "/etc/tasklane");
        assert!(matches!(cli.command, Command::Retry(ref t) if t.driver.as_deref() == Some("database")));

        let cli = Cli::try_parse_from(["tasklane-worker", "stats", "-q", "reports"]).unwrap();
        assert!(matches!(cli.command, Command::Stats { queue: Some(ref q) } if q == "reports"));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["tasklane-worker"]).is_err());
    }
}
