//! Command line surface.
//!
//! # Responsibilities
//! - Parse the operator's command (`start`, `stop`, `restart`, `setup`, `generate`, `print-routes`)
//! - Wire the lifecycle controller for `start`
//! - Signal a running instance through its PID file for `stop`
//! - Prepare the working directory and a systemd unit for `setup`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::loader::{load_or_create, write_default_config};
use crate::config::{AppConfig, ConfigError, ConfigSource, FileConfigSource};
use crate::http::{default_handlers, RegisterHandlers, ROUTES};
use crate::lifecycle::{Controller, ControllerOptions, PidFile, PidFileError, PidRecord};
use crate::net::{CertError, CertificateProvisioner, Provisioned, SelfSignedProvisioner};

/// Where `setup` writes the systemd unit by default.
pub const DEFAULT_UNIT_PATH: &str = "/etc/systemd/system/packagelock.service";

/// How long `restart` waits for the old process to exit.
pub const STOP_WAIT: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "packagelock")]
#[command(about = "Packagelock server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    /// Override the PID file location from the configuration
    #[arg(long, global = true)]
    pub pid_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the server in the foreground until it is stopped
    Start,
    /// Ask a running server to shut down
    Stop,
    /// Stop a running server, then start a new one in this process
    Restart,
    /// Create the logs/ and certs/ directories and a systemd unit
    Setup {
        /// Where to write the unit file
        #[arg(long, default_value = DEFAULT_UNIT_PATH)]
        unit: PathBuf,

        /// User the service runs as
        #[arg(long)]
        user: Option<String>,

        /// Group the service runs as
        #[arg(long)]
        group: Option<String>,
    },
    /// Write default files
    Generate {
        #[command(subcommand)]
        target: GenerateTarget,
    },
    /// List the HTTP routes the server registers
    PrintRoutes,
}

#[derive(Debug, Subcommand)]
pub enum GenerateTarget {
    /// Create a self-signed certificate at the configured paths
    Certs,
    /// Write the default configuration file
    Config {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[cfg(unix)]
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Process {pid} is still running after {waited:?}")]
    StillRunning { pid: u32, waited: Duration },

    #[error("{0:?} already exists; pass --force to overwrite it")]
    AlreadyExists(PathBuf),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl Cli {
    fn pid_file_for(&self, configured: &Path) -> PathBuf {
        self.pid_file.clone().unwrap_or_else(|| configured.to_path_buf())
    }
}

/// Run the parsed command. Returns the process exit code.
pub async fn execute(cli: Cli) -> Result<u8, CliError> {
    match &cli.command {
        Commands::Start => start(&cli).await,
        Commands::Stop => {
            stop(&cli)?;
            Ok(0)
        }
        Commands::Restart => restart(&cli).await,
        Commands::Setup { unit, user, group } => {
            setup(&cli, unit, user.as_deref(), group.as_deref())?;
            Ok(0)
        }
        Commands::Generate { target } => {
            generate(&cli, target)?;
            Ok(0)
        }
        Commands::PrintRoutes => {
            for line in route_lines() {
                println!("{line}");
            }
            Ok(0)
        }
    }
}

async fn start(cli: &Cli) -> Result<u8, CliError> {
    let config = load_or_create(&cli.config)?;
    let options = ControllerOptions {
        pid_file: cli.pid_file_for(&config.lifecycle.pid_file),
        ..ControllerOptions::default()
    };

    let file_source = FileConfigSource::new(&cli.config);
    tracing::info!(config = ?file_source.path(), pid_file = ?options.pid_file, "Using configuration");
    let source: Arc<dyn ConfigSource> = Arc::new(file_source);
    let provisioner = Arc::new(SelfSignedProvisioner::for_host(&config.network.host));
    let register: Arc<RegisterHandlers> = Arc::new(default_handlers);

    let status = Controller::new(source, provisioner, register, options).run().await;
    Ok(status.code() as u8)
}

/// Signal the recorded process and remove its PID file.
///
/// Returns the pid that was signalled, or `None` if the record was stale.
fn stop(cli: &Cli) -> Result<Option<PidRecord>, CliError> {
    let pid_file = resolve_pid_file(cli);
    let record = PidFile::read(&pid_file)?;

    if !is_alive(record)? {
        tracing::warn!(pid = record.pid(), path = ?pid_file, "Recorded process is not running, removing stale PID file");
        PidFile::release_record(&pid_file, record)?;
        return Ok(None);
    }

    send_terminate(record)?;
    tracing::info!(pid = record.pid(), "Shutdown requested");
    PidFile::release_record(&pid_file, record)?;
    Ok(Some(record))
}

async fn restart(cli: &Cli) -> Result<u8, CliError> {
    match stop(cli) {
        Ok(Some(record)) => wait_for_exit(record, STOP_WAIT).await?,
        Ok(None) => {}
        Err(CliError::PidFile(PidFileError::Missing { path })) => {
            tracing::info!(path = ?path, "No running server found, starting a new one");
        }
        Err(e) => return Err(e),
    }
    start(cli).await
}

async fn wait_for_exit(record: PidRecord, limit: Duration) -> Result<(), CliError> {
    let deadline = tokio::time::Instant::now() + limit;
    while is_alive(record)? {
        if tokio::time::Instant::now() >= deadline {
            return Err(CliError::StillRunning {
                pid: record.pid(),
                waited: limit,
            });
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    tracing::info!(pid = record.pid(), "Previous server exited");
    Ok(())
}

/// Unit file settings rendered by `setup`.
struct UnitFile<'a> {
    exec: &'a Path,
    config: &'a Path,
    working_dir: &'a Path,
    user: Option<&'a str>,
    group: Option<&'a str>,
}

impl UnitFile<'_> {
    fn render(&self) -> String {
        let mut service = format!(
            "ExecStart={} --config {} start\nWorkingDirectory={}\nRestart=always\n",
            self.exec.display(),
            self.config.display(),
            self.working_dir.display()
        );
        if let Some(user) = self.user {
            service.push_str(&format!("User={user}\n"));
        }
        if let Some(group) = self.group {
            service.push_str(&format!("Group={group}\n"));
        }

        format!(
            "[Unit]\nDescription=PackageLock Management Server\nAfter=network.target\n\n\
             [Service]\n{service}\n\
             [Install]\nWantedBy=multi-user.target\n"
        )
    }
}

fn setup(cli: &Cli, unit: &Path, user: Option<&str>, group: Option<&str>) -> Result<(), CliError> {
    let working_dir = std::env::current_dir().map_err(|source| CliError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    let exec = std::env::current_exe().map_err(|source| CliError::Io {
        path: PathBuf::from("current executable"),
        source,
    })?;
    let config = working_dir.join(&cli.config);

    prepare_install(
        &working_dir,
        unit,
        &UnitFile {
            exec: &exec,
            config: &config,
            working_dir: &working_dir,
            user,
            group,
        },
    )
}

fn prepare_install(base: &Path, unit_path: &Path, unit: &UnitFile<'_>) -> Result<(), CliError> {
    for dir in ["logs", "certs"] {
        let path = base.join(dir);
        std::fs::create_dir_all(&path).map_err(|source| CliError::Io {
            path: path.clone(),
            source,
        })?;
        println!("Created {}", path.display());
    }

    std::fs::write(unit_path, unit.render()).map_err(|source| {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            tracing::error!(path = ?unit_path, "Cannot write the unit file; run setup with sufficient privileges or pass --unit");
        }
        CliError::Io {
            path: unit_path.to_path_buf(),
            source,
        }
    })?;
    tracing::info!(path = ?unit_path, "Systemd unit written");
    println!("Systemd unit file created at {}", unit_path.display());
    Ok(())
}

fn generate(cli: &Cli, target: &GenerateTarget) -> Result<(), CliError> {
    match target {
        GenerateTarget::Config { force } => {
            if cli.config.exists() && !force {
                return Err(CliError::AlreadyExists(cli.config.clone()));
            }
            write_default_config(&cli.config)?;
            println!("Wrote {}", cli.config.display());
        }
        GenerateTarget::Certs => {
            let config = load_or_create(&cli.config)?;
            let network = &config.network;
            if !network.tls {
                tracing::warn!("TLS is disabled in the configuration; certificates will not be used");
            }
            let provisioner = SelfSignedProvisioner::for_host(&network.host);
            match provisioner.provision(&network.cert_path, &network.key_path)? {
                Provisioned::Generated => println!(
                    "Wrote {} and {}",
                    network.cert_path.display(),
                    network.key_path.display()
                ),
                Provisioned::Existing => println!(
                    "{} and {} already exist",
                    network.cert_path.display(),
                    network.key_path.display()
                ),
            }
        }
    }
    Ok(())
}

/// PID file path without creating a config file as a side effect.
///
/// The config is read without validation: a server keeps running on a
/// broken edit, and `stop` must still find it.
fn resolve_pid_file(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.pid_file {
        return path.clone();
    }

    let default = || PathBuf::from(crate::lifecycle::DEFAULT_PID_FILE);
    let content = match std::fs::read_to_string(&cli.config) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default(),
        Err(e) => {
            tracing::warn!(path = ?cli.config, error = %e, "Could not read config, using default PID file");
            return default();
        }
    };
    match toml::from_str::<AppConfig>(&content) {
        Ok(config) => config.lifecycle.pid_file,
        Err(e) => {
            tracing::warn!(path = ?cli.config, error = %e, "Could not parse config, using default PID file");
            default()
        }
    }
}

fn route_lines() -> Vec<String> {
    ROUTES
        .iter()
        .map(|(method, path)| format!("{method:<6} {path}"))
        .collect()
}

#[cfg(unix)]
fn send_terminate(record: PidRecord) -> Result<(), CliError> {
    use nix::sys::signal::{kill, Signal};

    kill(nix_pid(record), Signal::SIGTERM).map_err(|source| CliError::Signal {
        pid: record.pid(),
        source,
    })
}

#[cfg(unix)]
fn is_alive(record: PidRecord) -> Result<bool, CliError> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    match kill(nix_pid(record), None) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => Ok(true),
        Err(source) => Err(CliError::Signal {
            pid: record.pid(),
            source,
        }),
    }
}

#[cfg(unix)]
fn nix_pid(record: PidRecord) -> nix::unistd::Pid {
    nix::unistd::Pid::from_raw(record.pid() as i32)
}

#[cfg(not(unix))]
fn send_terminate(_record: PidRecord) -> Result<(), CliError> {
    Err(CliError::Unsupported("stop"))
}

#[cfg(not(unix))]
fn is_alive(_record: PidRecord) -> Result<bool, CliError> {
    Err(CliError::Unsupported("stop"))
}
