//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dh", about = "Data hub synchronization engine", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the scheduler and worker pool
    Run {
        /// Engine config YAML; defaults come from the environment
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a task definition payload and print the normalized form
    CheckTask {
        /// JSON file with the task definition
        file: PathBuf,
        /// Owner recorded on the normalized task
        #[arg(long, default_value = "operator")]
        owner: String,
    },

    /// Print upcoming fire times for a cron expression
    NextRuns {
        #[arg(long)]
        cron: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["dh", "run", "--config", "engine.yaml"]);
        match cli.command {
            Command::Run { config } => assert_eq!(config.unwrap(), PathBuf::from("engine.yaml")),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_next_runs_defaults() {
        let cli = Cli::parse_from(["dh", "next-runs", "--cron", "*/5 * * * *"]);
        match cli.command {
            Command::NextRuns { cron, tz, count } => {
                assert_eq!(cron, "*/5 * * * *");
                assert_eq!(tz, "UTC");
                assert_eq!(count, 5);
            }
            _ => panic!("expected next-runs"),
        }
    }

    #[test]
    fn test_parse_check_task() {
        let cli = Cli::parse_from(["dh", "check-task", "task.json", "--owner", "ops"]);
        match cli.command {
            Command::CheckTask { file, owner } => {
                assert_eq!(file, PathBuf::from("task.json"));
                assert_eq!(owner, "ops");
            }
            _ => panic!("expected check-task"),
        }
    }
}
