//! Command handlers behind the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::builder::CommandBuilder;
use crate::cli::{Cli, Commands, LogsOpts, PortsOpts, RunsAction, RunsCommand, UpOpts};
use crate::config::{self, Config, StateLayout};
use crate::configgen::TemplateConfigGenerator;
use crate::infra;
use crate::ports;
use crate::registry::Supervisor;
use crate::runs::{self, GhRunProbe};
use crate::shutdown::StopOutcome;
use crate::stack::{Stack, UpOptions};

pub fn run(cli: Cli) -> Result<()> {
    let rt = Runtime::new().context("failed to create tokio runtime")?;
    rt.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⚠ interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Commands::Ports(opts) => return ports_cmd(opts).await,
        Commands::Runs(cmd) => return runs_cmd(&cancel, cmd).await,
        _ => {}
    }

    let cfg = load_config(cli.config.as_deref())?;
    let layout = StateLayout::new(cfg.state_dir(cli.state_dir.as_deref()));
    let supervisor = Supervisor::open(layout.clone(), cfg.shutdown.policy())
        .with_context(|| format!("failed to open state directory {}", layout.root().display()))?;

    let builder = CommandBuilder::new().with_env("NETWORK", cfg.network());
    let infra = infra::from_config(&cfg);
    let configgen = TemplateConfigGenerator::new(layout.root());
    let stack = Stack::new(&cfg, &supervisor, &builder, infra.as_ref(), &configgen);

    match cli.command {
        Commands::Up(opts) => up(&stack, &cancel, opts).await,
        Commands::Down => down(&stack, &cancel).await,
        Commands::Status => {
            status(&stack);
            Ok(())
        }
        Commands::Stop(opts) => {
            let outcome = supervisor.stop(&cancel, &opts.name).await?;
            match outcome {
                StopOutcome::AlreadyExited => println!("✓ {} had already exited", opts.name),
                StopOutcome::Graceful => println!("✓ stopped {}", opts.name),
                StopOutcome::Forced => println!("⚠ {} ignored SIGTERM and was killed", opts.name),
            }
            Ok(())
        }
        Commands::Restart(opts) => {
            let info = stack.restart(&cancel, &opts.name).await?;
            println!("✓ restarted {} (pid {})", info.name, info.pid);
            Ok(())
        }
        Commands::Logs(opts) => logs(&supervisor, &cancel, opts).await,
        Commands::Ports(_) | Commands::Runs(_) => Ok(()),
    }
}

fn load_config(flag: Option<&Path>) -> Result<Config> {
    let path: PathBuf = match flag {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            config::find_config(&cwd).with_context(|| {
                format!(
                    "no {} found in {} or any parent directory",
                    config::CONFIG_FILE_NAME,
                    cwd.display()
                )
            })?
        }
    };
    config::load(&path)
}

async fn up(stack: &Stack<'_>, cancel: &CancellationToken, opts: UpOpts) -> Result<()> {
    let report = stack
        .up(
            cancel,
            UpOptions {
                skip_build: opts.skip_build,
            },
        )
        .await?;

    for name in &report.built {
        println!("✓ built {name}");
    }
    for warning in &report.warnings {
        println!("⚠ {warning}");
    }
    for endpoint in &report.endpoints {
        let note = if endpoint.reused { " (already running)" } else { "" };
        match &endpoint.url {
            Some(url) => println!("✓ {} pid {} at {url}{note}", endpoint.name, endpoint.pid),
            None => println!("✓ {} pid {}{note}", endpoint.name, endpoint.pid),
        }
    }
    Ok(())
}

async fn down(stack: &Stack<'_>, cancel: &CancellationToken) -> Result<()> {
    let report = stack.down(cancel).await?;
    for conflict in &report.killed {
        println!("✓ killed orphan: {conflict}");
    }
    for warning in &report.warnings {
        println!("⚠ {warning}");
    }
    println!("✓ removed {} log file(s)", report.logs_removed);
    println!("✓ stack is down");
    Ok(())
}

fn status(stack: &Stack<'_>) {
    let report = stack.status();
    if report.services.is_empty() {
        println!("No services configured.");
    }
    for svc in &report.services {
        let marker = if svc.running { "✓" } else { "✗" };
        let pid = svc
            .pid
            .map(|pid| format!("pid {pid}"))
            .unwrap_or_else(|| "stopped".to_string());
        let port = svc.port.map(|p| format!(" :{p}")).unwrap_or_default();
        println!("{marker} {:<16} {:<9} {pid}{port}", svc.name, svc.tier.as_str());
    }
    for orphan in &report.orphans {
        println!("⚠ orphan: {orphan}");
    }
    for info in &report.unknown {
        println!("⚠ {} (pid {}) is managed but not in the config", info.name, info.pid);
    }
}

async fn logs(supervisor: &Supervisor, cancel: &CancellationToken, opts: LogsOpts) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    supervisor
        .tail_logs(cancel, &opts.name, opts.follow, &mut stdout)
        .await?;
    Ok(())
}

async fn ports_cmd(opts: PortsOpts) -> Result<()> {
    let conflicts = ports::check_ports(&opts.ports);
    for port in &opts.ports {
        if !conflicts.iter().any(|c| c.port == *port) {
            println!("✓ port {port} is free");
        }
    }

    let mut failed = false;
    for conflict in conflicts {
        println!("✗ {conflict}");
        if !opts.kill {
            continue;
        }
        let Some(pid) = conflict.pid else {
            println!("⚠ cannot kill: owner of port {} is unknown", conflict.port);
            failed = true;
            continue;
        };
        match tokio::task::spawn_blocking(move || ports::kill_process(pid)).await? {
            Ok(()) => println!("✓ killed pid {pid}"),
            Err(err) => {
                println!("✗ failed to kill pid {pid}: {err}");
                failed = true;
            }
        }
    }
    if failed {
        bail!("some ports could not be freed");
    }
    Ok(())
}

async fn runs_cmd(cancel: &CancellationToken, cmd: RunsCommand) -> Result<()> {
    let RunsAction::Watch(opts) = cmd.action;
    let probe = Arc::new(GhRunProbe::new(&opts.repo)?);
    println!("Watching {} run(s) in {}", opts.ids.len(), opts.repo);

    let results = tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled"),
        results = runs::poll_all(
            opts.ids,
            Duration::from_secs(opts.timeout_secs),
            Duration::from_secs(opts.interval_secs.max(1)),
            probe,
        ) => results,
    };

    let mut ok = true;
    for (id, outcome) in &results {
        let marker = if outcome.is_success() { "✓" } else { "✗" };
        ok &= outcome.is_success();
        println!("{marker} run {id}: {outcome}");
    }
    if !ok {
        bail!("not every run succeeded");
    }
    Ok(())
}
