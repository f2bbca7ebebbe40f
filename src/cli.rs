use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command line interface for the local developer stack.
#[derive(Parser, Debug)]
#[command(
    name = "devstack",
    version = version_with_build_time(),
    about = "Build, run and tear down the local developer stack"
)]
pub struct Cli {
    /// Path to devstack.toml (defaults to the nearest one above the current directory).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Override the state directory holding pids/, logs/ and configs/.
    #[arg(long, global = true, value_name = "PATH")]
    pub state_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

/// Returns version string with relative build time (e.g., "0.1.0 (built 5m ago)")
fn version_with_build_time() -> &'static str {
    use std::sync::OnceLock;
    static VERSION: OnceLock<String> = OnceLock::new();

    const BUILD_TIMESTAMP_STR: &str = include_str!(concat!(env!("OUT_DIR"), "/build_timestamp.txt"));

    VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        let build_timestamp: u64 = BUILD_TIMESTAMP_STR.trim().parse().unwrap_or(0);

        if build_timestamp == 0 {
            return version.to_string();
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let elapsed = now.saturating_sub(build_timestamp);
        format!("{version} (built {})", format_relative_time(elapsed))
    })
}

fn format_relative_time(seconds: u64) -> String {
    match seconds {
        0..60 => format!("{seconds}s ago"),
        60..3600 => format!("{}m ago", seconds / 60),
        3600..86400 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86400),
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Build, configure and start the whole stack.",
        long_about = "Builds missing binaries, starts infrastructure and waits for it, renders service configs, checks that every service port is free, then starts services in tier order (engines, APIs, backend, frontend) and prints their endpoints."
    )]
    Up(UpOpts),
    #[command(
        about = "Stop everything and tear down infrastructure.",
        long_about = "Stops every managed process (including ones left by an earlier run), kills orphans still holding service ports, deletes log files, and removes infrastructure containers and volumes."
    )]
    Down,
    #[command(about = "Show which services are running and any orphaned ports.")]
    Status,
    #[command(about = "Stop one service.")]
    Stop(ServiceOpts),
    #[command(about = "Restart one service with its previous command line.")]
    Restart(ServiceOpts),
    #[command(about = "Print or follow a service's log.")]
    Logs(LogsOpts),
    #[command(about = "Report processes holding TCP ports, optionally killing them.")]
    Ports(PortsOpts),
    #[command(about = "Watch GitHub workflow runs until they finish.")]
    Runs(RunsCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct UpOpts {
    /// Fail instead of building when a binary is missing.
    #[arg(long)]
    pub skip_build: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServiceOpts {
    /// Service name as declared in devstack.toml.
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct LogsOpts {
    pub name: String,
    /// Keep streaming new output until interrupted.
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PortsOpts {
    #[arg(required = true)]
    pub ports: Vec<u16>,
    /// Terminate whatever holds the ports.
    #[arg(long)]
    pub kill: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunsCommand {
    #[command(subcommand)]
    pub action: RunsAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RunsAction {
    Watch(RunsWatchOpts),
}

#[derive(Args, Debug, Clone)]
pub struct RunsWatchOpts {
    /// Repository in owner/name form.
    #[arg(long)]
    pub repo: String,
    #[arg(required = true, value_name = "RUN_ID")]
    pub ids: Vec<String>,
    #[arg(long, default_value_t = 1800)]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = 15)]
    pub interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["devstack", "logs", "api", "-f", "--state-dir", "/tmp/s"])
            .expect("parse");
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/s")));
        match cli.command {
            Commands::Logs(opts) => {
                assert_eq!(opts.name, "api");
                assert!(opts.follow);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn runs_watch_requires_ids() {
        assert!(Cli::try_parse_from(["devstack", "runs", "watch", "--repo", "o/r"]).is_err());
        let cli = Cli::try_parse_from(["devstack", "runs", "watch", "--repo", "o/r", "1", "2"])
            .expect("parse");
        let Commands::Runs(RunsCommand {
            action: RunsAction::Watch(opts),
        }) = cli.command
        else {
            panic!("expected runs watch");
        };
        assert_eq!(opts.ids, ["1", "2"]);
        assert_eq!(opts.timeout_secs, 1800);
    }

    #[test]
    fn relative_time_buckets() {
        assert_eq!(format_relative_time(5), "5s ago");
        assert_eq!(format_relative_time(120), "2m ago");
        assert_eq!(format_relative_time(7200), "2h ago");
        assert_eq!(format_relative_time(172800), "2d ago");
    }
}
