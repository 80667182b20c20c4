use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hearth_core::Config;
use hearth_scheduler::Params;

/// Task scheduler for home-server maintenance jobs.
///
/// Management commands read and write the task store directly and print JSON
/// to stdout. Commands that change tasks refuse to run while `serve` holds
/// the store. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "hearth", version, about)]
pub struct Cli {
    /// Config profile; keys are looked up as `{PROFILE}_{KEY}` first.
    #[arg(long, global = true, env = "HEARTH_PROFILE")]
    pub profile: Option<String>,

    /// Directory holding the scheduler database.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Database file name inside the data directory.
    #[arg(long, global = true)]
    pub db_file: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Build the effective config: env (and profile) first, then flags.
    pub fn config(&self) -> Config {
        let mut config = match self.profile.as_deref() {
            Some(profile) => Config::for_profile(profile),
            None => Config::from_env(),
        };
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(file) = &self.db_file {
            config.storage.db_file = file.clone();
        }
        if let Command::Serve {
            tick_secs,
            shutdown_timeout,
            ..
        } = &self.command
        {
            if let Some(secs) = tick_secs {
                config.scheduler.tick_secs = *secs;
            }
            if let Some(secs) = shutdown_timeout {
                config.scheduler.shutdown_timeout_secs = *secs;
            }
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until interrupted with ctrl-c.
    Serve {
        /// Seconds between due-task scans.
        #[arg(long)]
        tick_secs: Option<u64>,

        /// Seconds to wait for running executions on shutdown.
        #[arg(long)]
        shutdown_timeout: Option<u64>,

        /// Print scheduler events to stdout as JSON lines.
        #[arg(long)]
        events: bool,
    },

    /// Register a new task.
    Add {
        #[arg(long)]
        name: String,

        /// Handler type, e.g. `command` or `noop`.
        #[arg(long = "type")]
        task_type: String,

        /// `hourly`, `daily`, `every 30m`, `every 1h`, `every 6h`, or empty for manual-only.
        #[arg(long, default_value = "")]
        schedule: String,

        /// Explicit task id; generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// Handler params as a JSON object.
        #[arg(long, value_parser = parse_params)]
        params: Option<Params>,

        /// Create the task disabled (manual runs only).
        #[arg(long)]
        disabled: bool,
    },

    /// List all tasks.
    List,

    /// Show one task.
    Show { id: String },

    /// Change a task's definition.
    Update {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        schedule: Option<String>,

        #[arg(long, value_parser = parse_params)]
        params: Option<Params>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Delete a task and its execution history.
    Delete { id: String },

    /// Execute a task now and wait for it to finish.
    Run {
        id: String,

        /// Give up waiting after this many seconds and cancel the run.
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },

    /// Show recent executions of a task, newest first.
    History {
        id: String,

        /// Defaults to HEARTH_HISTORY_LIMIT.
        #[arg(long)]
        limit: Option<u32>,
    },
}

fn parse_params(raw: &str) -> Result<Params, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("params must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_must_be_an_object() {
        let params = parse_params(r#"{"program": "true"}"#).unwrap();
        assert_eq!(params["program"], "true");
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("{").is_err());
    }

    #[test]
    fn serve_flags_override_config() {
        let cli = Cli::parse_from([
            "hearth",
            "--data-dir",
            "/var/lib/hearth",
            "serve",
            "--tick-secs",
            "5",
        ]);
        let config = cli.config();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/hearth"));
        assert_eq!(config.scheduler.tick_secs, 5);
    }

    #[test]
    fn add_parses_type_and_params() {
        let cli = Cli::parse_from([
            "hearth",
            "add",
            "--name",
            "Backup",
            "--type",
            "command",
            "--schedule",
            "daily",
            "--params",
            r#"{"program": "rsync", "args": ["-a", "/srv", "/mnt"]}"#,
        ]);
        match cli.command {
            Command::Add {
                task_type, params, ..
            } => {
                assert_eq!(task_type, "command");
                assert_eq!(params.unwrap()["args"][0], "-a");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
