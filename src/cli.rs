//! `upyfs` command line.

use crate::config::LinkConfig;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use upylink_serial::serial::port_scanner::{find_device, scan_ports, BoardRegistry, ScanOptions};
use upylink_serial::serial::{
    BaudRate, DeviceFamily, DeviceFileOps, FlowControlledTransport, PortHandle, RawReplConfig,
    ReplError, ReplResult, SystemTransport,
};

#[derive(Debug, Parser)]
#[command(name = "upyfs")]
#[command(version)]
#[command(about = "Copy files to and from a MicroPython board over serial")]
pub struct Cli {
    /// Serial port; auto-detected when omitted.
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    /// Raw REPL response deadline in milliseconds.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Settings file instead of the default location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// List serial ports and the boards recognised on them.
    Ports,
    /// List the files on the device.
    Ls,
    /// Copy a device file to the computer.
    Get {
        remote: String,
        /// Defaults to the remote name in the current directory.
        local: Option<PathBuf>,
    },
    /// Copy a local file to the device.
    Put {
        local: PathBuf,
        /// Defaults to the local file name.
        remote: Option<String>,
    },
    /// Delete a file on the device.
    Rm { remote: String },
    /// Show the firmware's `os.uname()`.
    Version,
}

/// Port picked for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub port_name: String,
    pub family: DeviceFamily,
}

impl Cli {
    /// Settings file with this invocation's flags applied.
    pub fn link_config(&self) -> ReplResult<LinkConfig> {
        let mut config = LinkConfig::load_or_default(self.config.as_deref())?;
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud_rate = BaudRate::from_value(baud);
        }
        Ok(config)
    }

    /// Raw REPL settings for `family`, with `--timeout-ms` applied.
    pub fn raw_repl_config(&self, config: &LinkConfig, family: DeviceFamily) -> RawReplConfig {
        let mut raw = config.raw_repl_config(family);
        if let Some(ms) = self.timeout_ms {
            raw.response_timeout_ms = ms;
        }
        raw
    }
}

pub async fn run(cli: Cli) -> ReplResult<()> {
    let config = cli.link_config()?;
    let registry = config.registry();
    let mut out = std::io::stdout();

    if cli.command == Command::Ports {
        return list_ports(&registry, &mut out).await;
    }

    let target = resolve_target(&config, &registry).await?;
    let port = open_port(&config, &target).await?;
    let raw = cli.raw_repl_config(&config, target.family);
    let result = execute(&cli.command, &port, raw, &mut out).await;
    if let Err(e) = port.close().await {
        tracing::warn!("Closing {} failed: {}", target.port_name, e);
    }
    result
}

/// Named port if there is one, else the first attached known board.
pub async fn resolve_target(config: &LinkConfig, registry: &BoardRegistry) -> ReplResult<Target> {
    if let Some(port_name) = &config.port {
        return Ok(Target {
            port_name: port_name.clone(),
            family: config.family.unwrap_or_default(),
        });
    }
    let ports = scan_ports(registry, &ScanOptions::default()).await?;
    match find_device(registry, &ports) {
        Some(found) => Ok(Target {
            port_name: found.port.port_name,
            family: config.family.unwrap_or(found.board.family),
        }),
        None => Err(ReplError::port_unavailable(
            "Could not find an attached device. Make sure it is plugged in or name it with --port.",
        )),
    }
}

async fn open_port(config: &LinkConfig, target: &Target) -> ReplResult<PortHandle> {
    let serial = config.serial_config(&target.port_name);
    let system = SystemTransport::new(&target.port_name);
    tracing::debug!("Opening {} as {}", target.port_name, target.family.label());
    if target.family.needs_flow_control() {
        let transport = FlowControlledTransport::new(system, config.flow_control.clone());
        PortHandle::open(transport, &serial).await
    } else {
        PortHandle::open(system, &serial).await
    }
}

async fn list_ports(registry: &BoardRegistry, out: &mut dyn Write) -> ReplResult<()> {
    let ports = scan_ports(registry, &ScanOptions::default()).await?;
    if ports.is_empty() {
        return emit(out, "No serial ports found.");
    }
    for port in &ports {
        let label = match registry.match_port(port) {
            Some(board) => format!("{} ({})", board.name, board.family.label()),
            None => port.description.clone().unwrap_or_else(|| "-".to_string()),
        };
        emit(out, &format!("{}\t{}", port.port_name, label))?;
    }
    Ok(())
}

fn emit(out: &mut dyn Write, line: &str) -> ReplResult<()> {
    writeln!(out, "{}", line).map_err(|e| ReplError::local_io(format!("Cannot write output: {}", e)))
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Run one file command on an open port, printing results to `out`.
pub async fn execute(
    command: &Command,
    port: &PortHandle,
    raw: RawReplConfig,
    out: &mut dyn Write,
) -> ReplResult<()> {
    let ops = DeviceFileOps::new(port, raw);
    match command {
        // Needs no port; `run` answers it before opening one.
        Command::Ports => Ok(()),
        Command::Ls => {
            for name in ops.list().await? {
                emit(out, &name)?;
            }
            Ok(())
        }
        Command::Get { remote, local } => {
            let local = match local {
                Some(path) => path.clone(),
                None => PathBuf::from(base_name(Path::new(remote)).unwrap_or_else(|| remote.clone())),
            };
            let data = ops.read(remote).await?;
            tokio::fs::write(&local, &data).await.map_err(|e| {
                ReplError::local_io(format!("Cannot write {}: {}", local.display(), e))
            })?;
            tracing::info!("Copied {} to {} ({} bytes)", remote, local.display(), data.len());
            Ok(())
        }
        Command::Put { local, remote } => {
            let remote = match remote {
                Some(name) => name.clone(),
                None => base_name(local).ok_or_else(|| {
                    ReplError::local_io(format!("{} has no file name", local.display()))
                })?,
            };
            let data = tokio::fs::read(local).await.map_err(|e| {
                ReplError::local_io(format!("Cannot read {}: {}", local.display(), e))
            })?;
            ops.write(&data, &remote).await?;
            tracing::info!("Copied {} to {} ({} bytes)", local.display(), remote, data.len());
            Ok(())
        }
        Command::Rm { remote } => {
            ops.delete(remote).await?;
            tracing::info!("Deleted {}", remote);
            Ok(())
        }
        Command::Version => {
            for (key, value) in ops.version().await? {
                emit(out, &format!("{}: {}", key, value))?;
            }
            Ok(())
        }
    }
}
