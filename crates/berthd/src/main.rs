//! berthd — Berth operator binary.
//!
//! Operator-side tools around the scheduler backends:
//! - validate a `berth.toml`
//! - list the jobs recorded in the state store
//! - attach a terminal to the container behind a running task
//!
//! # Usage
//!
//! ```text
//! berthd --config /etc/berth/berth.toml check-config
//! berthd jobs --app 1234 --version v4
//! berthd attach --host 10.0.0.1 --task arn:aws:ecs:...:task/default/abc
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use berth_core::BerthConfig;
use berth_docker::DockerClient;
use berth_ecs::EcsSettings;
use berth_ecs::attach::TASK_ARN_LABEL;
use berth_ecs::types::{AttachOptions, ContainerFilter};
use berth_scheduler::RunIo;
use berth_state::{JobQuery, StateStore};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

const STATE_FILE: &str = "berth.redb";

#[derive(Parser)]
#[command(name = "berthd", about = "Berth operator tools")]
struct Cli {
    /// Path to berth.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print it resolved.
    CheckConfig,

    /// List recorded jobs for an app.
    Jobs {
        #[arg(long)]
        app: String,

        /// Only jobs of this release.
        #[arg(long)]
        version: Option<String>,

        /// Overrides `state.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Attach this terminal to the container running a task.
    Attach {
        /// Private address of the host running the task.
        #[arg(long)]
        host: String,

        /// Task ARN.
        #[arg(long)]
        task: String,

        /// Overrides `runtime.port`.
        #[arg(long)]
        port: Option<u16>,

        /// The container has no TTY; demultiplex stdout and stderr.
        #[arg(long)]
        no_tty: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Jobs {
            app,
            version,
            data_dir,
        } => list_jobs(&config, app, version, data_dir),
        Command::Attach {
            host,
            task,
            port,
            no_tty,
        } => attach(&host, port.unwrap_or(config.runtime.port), &task, no_tty).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,berthd=debug,berth=debug"));
    // Logs go to stderr so `jobs` output stays machine readable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BerthConfig> {
    match path {
        Some(path) => {
            let config = BerthConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => {
            debug!("no config file given, using defaults");
            Ok(BerthConfig::default())
        }
    }
}

fn check_config(config: &BerthConfig) -> anyhow::Result<()> {
    config.validate()?;
    let settings = EcsSettings::from_config(config)?;
    info!(
        cluster = %settings.cluster,
        delimiter = %settings.names.delimiter(),
        pending_timeout = ?settings.pending_timeout,
        "config is valid"
    );
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn list_jobs(
    config: &BerthConfig,
    app: String,
    version: Option<String>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| config.state.data_dir.clone());
    let db_path = data_dir.join(STATE_FILE);
    if !db_path.exists() {
        bail!("no state store at {}", db_path.display());
    }
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let query = match version {
        Some(version) => JobQuery::release(app, version),
        None => JobQuery::app(app),
    };
    let jobs = store.list_jobs(&query)?;
    debug!(count = jobs.len(), "jobs listed");
    for job in &jobs {
        println!("{}", serde_json::to_string(job)?);
    }
    Ok(())
}

async fn attach(host: &str, port: u16, task: &str, no_tty: bool) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let mut client = DockerClient::connect(&addr).await?;

    let filter = ContainerFilter {
        label: (TASK_ARN_LABEL.to_string(), task.to_string()),
        all: true,
    };
    let containers = client.containers(&filter).await?;
    let container = match containers.as_slice() {
        [one] => one.id.clone(),
        [] => bail!("no container for task {task} on {addr}"),
        many => bail!(
            "{} containers for task {task} on {addr}, expected one",
            many.len()
        ),
    };

    info!(%addr, %task, container = %container, "attaching");
    let options = AttachOptions {
        raw_terminal: !no_tty,
        ..AttachOptions::interactive()
    };
    let io = RunIo::new(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr());
    client.attach_to(&container, options, io).await?;
    info!(%task, "session ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attach() {
        let cli = Cli::parse_from([
            "berthd",
            "attach",
            "--host",
            "10.0.0.1",
            "--task",
            "arn:task/abc",
            "--no-tty",
        ]);
        match cli.command {
            Command::Attach {
                host, port, no_tty, ..
            } => {
                assert_eq!(host, "10.0.0.1");
                assert_eq!(port, None);
                assert!(no_tty);
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from([
            "berthd",
            "jobs",
            "--app",
            "1234",
            "--config",
            "/etc/berth.toml",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.config.as_deref(), Some(Path::new("/etc/berth.toml")));
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.command, Command::Jobs { version: None, .. }));
    }

    #[test]
    fn jobs_lists_a_release() {
        let dir = tempfile::tempdir().unwrap();
        drop(StateStore::open(&dir.path().join(STATE_FILE)).unwrap());

        let config = BerthConfig::default();
        list_jobs(&config, "1234".into(), Some("v1".into()), Some(dir.path().to_path_buf()))
            .unwrap();

        let missing = dir.path().join("missing");
        let err = list_jobs(&config, "1234".into(), None, Some(missing)).unwrap_err();
        assert!(err.to_string().contains("no state store"));
    }
}
