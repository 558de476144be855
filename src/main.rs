use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use colourado::{ColorPalette, PaletteType};
use itertools::zip;
use serde::Serialize;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use gpumon_ssh::config::{Config, Mode};
use gpumon_ssh::{
    resolve_target, CompletionQuery, HostStatus, HostTarget, HostsFile, Inventory, Monitor,
    MonitorError, Settings, SshConfigInventory, TransferOutcome,
};

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("GPUMON_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn default_ssh_config() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh").join("config"))
}

fn load_inventory(cli: &Config) -> Result<Box<dyn Inventory>, MonitorError> {
    if let Some(path) = &cli.hosts_file {
        return Ok(Box::new(HostsFile::load(path)?));
    }
    match cli.ssh_config.clone().or_else(default_ssh_config) {
        Some(path) => Ok(Box::new(SshConfigInventory::load(&path)?)),
        None => Ok(Box::new(SshConfigInventory::default())),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), MonitorError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).map_err(io::Error::from)?;
    writeln!(stdout)?;
    Ok(())
}

/// One colored line per host on stderr, next to the JSON on stdout.
fn report_statuses(hosts: &[HostTarget], statuses: &[HostStatus]) {
    if hosts.is_empty() {
        return;
    }
    let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
    for ((color, host), status) in zip(colors, hosts).zip(statuses) {
        let prefix = host.prettify(color);
        match (&status.summary, &status.error) {
            (Some(summary), _) => eprintln!(
                "{} {} GPUs, {}% util, {}% memory",
                prefix, summary.count, summary.util_avg, summary.mem_pct
            ),
            (None, Some(e)) => eprintln!("{} {}", prefix, e.red()),
            (None, None) => eprintln!("{} no GPUs", prefix),
        }
    }
}

async fn run(cli: &Config) -> Result<bool, MonitorError> {
    let inventory = load_inventory(cli)?;
    let default_user = cli.default_user.as_deref();
    let target = |alias: &str| resolve_target(&*inventory, alias, default_user);
    let monitor = Monitor::new(Settings::from(cli));

    match &cli.mode {
        Mode::Hosts => {
            print_json(&inventory.list_hosts())?;
            Ok(true)
        }
        Mode::Status { hosts } => {
            let aliases = if hosts.is_empty() {
                inventory.list_hosts()
            } else {
                hosts.clone()
            };
            let targets: Vec<HostTarget> =
                aliases.iter().map(|alias| target(alias.as_str())).collect();
            debug!("querying {} hosts", targets.len());
            let statuses = monitor.statuses(&targets).await;
            report_statuses(&targets, &statuses);
            print_json(&statuses)?;
            Ok(statuses.iter().all(|status| status.ok))
        }
        Mode::Procs { host, index } => {
            let result = monitor.processes(&target(host.as_str()), *index).await;
            print_json(&result)?;
            Ok(result.ok)
        }
        Mode::Exec { host, command, cwd } => {
            let invocation =
                monitor.invocation(target(host.as_str()), command.clone(), cwd.clone());
            let result = monitor.execute(&invocation).await;
            print_json(&result)?;
            Ok(result.ok)
        }
        Mode::Complete {
            host,
            prefix,
            cwd,
            mode,
        } => {
            let query = CompletionQuery {
                host: target(host.as_str()),
                prefix: prefix.clone(),
                working_dir: cwd.clone(),
                mode: *mode,
            };
            let result = monitor.complete(&query).await;
            print_json(&result)?;
            Ok(result.ok)
        }
        Mode::Upload {
            host,
            local,
            remote,
        } => {
            let file = tokio::fs::File::open(local).await?;
            let len = file.metadata().await?.len();
            let file_name = local.file_name().and_then(|name| name.to_str());
            let outcome = monitor
                .upload(&target(host.as_str()), remote, file_name, file, len)
                .await;
            print_json(&outcome)?;
            Ok(outcome.ok)
        }
        Mode::Download {
            host,
            remote,
            local,
        } => {
            let outcome = match monitor.download(&target(host.as_str()), remote).await {
                Ok(staged) => {
                    let mut out = tokio::fs::File::create(local).await?;
                    match staged.stream_to(&mut out).await {
                        Ok(n) => TransferOutcome::done(n),
                        Err(e) => TransferOutcome::failed(&MonitorError::Io(e)),
                    }
                }
                Err(outcome) => outcome,
            };
            print_json(&outcome)?;
            Ok(outcome.ok)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
