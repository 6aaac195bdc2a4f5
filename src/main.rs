use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use snapback::config::{Config, RemoteConfig};
use snapback::lineage::{PolicyKind, RetentionPolicy};
use snapback::server::{expand_tilde, inspect_repository, run_server};
use snapback::storage::{BtrfsStorage, RepositoryStorage};
use snapback::sync::{backup_remote, BackupClient};
use snapback::transport::SessionTarget;

#[derive(Parser, Debug)]
#[command(
    name = "snapback",
    version,
    about = "Incremental btrfs snapshot backup",
    arg_required_else_help = true
)]
struct Cli {
    /// Serve one backup session on stdin/stdout, storing into REPO.
    #[arg(long, value_name = "REPO")]
    server: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/snapback/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot a subvolume and send it to the repository.
    Backup(BackupArgs),

    /// Show the backup lineage stored in a repository.
    Graph(GraphArgs),
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// Subvolume to back up.
    subvolume: PathBuf,

    /// Directory holding the local snapshots.
    node_root: PathBuf,

    /// Repository reached through ssh, as `[user@]host[:repository]`.
    #[arg(long, value_name = "HOST", conflicts_with = "local")]
    ssh: Option<String>,

    /// Repository directory on this machine.
    #[arg(long, value_name = "REPO")]
    local: Option<PathBuf>,

    /// Retention policy (overrides the config file).
    #[arg(long, value_enum)]
    policy: Option<PolicyKind>,

    /// Fail instead of taking a full backup when no parent qualifies.
    #[arg(long)]
    no_full_fallback: bool,

    /// Command that runs the server side on its stdin/stdout.
    #[arg(last = true, value_name = "COMMAND", conflicts_with_all = ["ssh", "local"])]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct GraphArgs {
    /// Repository directory.
    repository: PathBuf,

    /// Machine-readable JSON output.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("snapback: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout is the protocol pipe in server mode.
fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(repository) = cli.server {
        run_server(&repository).await?;
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Command::Backup(args)) => backup(args, config).await,
        Some(Command::Graph(args)) => graph(args).await,
        None => anyhow::bail!("No command given; see --help"),
    }
}

async fn backup(args: BackupArgs, mut config: Config) -> Result<()> {
    if let Some(kind) = args.policy {
        config.policy.kind = kind;
    }
    if args.no_full_fallback {
        config.policy.allow_root_fallback = false;
    }

    let target = session_target(&args, &config)?;
    let storage = BtrfsStorage::new(&args.subvolume, &args.node_root)
        .with_binary(&config.btrfs.binary);
    let client = BackupClient::new(storage, RetentionPolicy::from_config(&config.policy));

    let report = backup_remote(&client, &target)
        .await
        .with_context(|| format!("Backup of {} failed", args.subvolume.display()))?;

    println!("{}", report.edge);
    if !report.pruned.is_empty() {
        tracing::info!(
            "Pruned: {}",
            report
                .pruned
                .iter()
                .map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

async fn graph(args: GraphArgs) -> Result<()> {
    let storage = RepositoryStorage::new(expand_tilde(&args.repository));
    let summary = inspect_repository(&storage)
        .await
        .with_context(|| format!("Failed to read repository {}", args.repository.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }
    Ok(())
}

/// Explicit command first, then a local repository, then ssh from the flag
/// merged over the `[remote]` config section.
fn session_target(args: &BackupArgs, config: &Config) -> Result<SessionTarget> {
    if !args.command.is_empty() {
        return Ok(SessionTarget::Command(args.command.clone()));
    }
    if let Some(repository) = &args.local {
        return Ok(SessionTarget::Local(repository.clone()));
    }

    let mut remote = config.remote.clone().unwrap_or_default();
    if let Some(arg) = &args.ssh {
        apply_ssh_arg(&mut remote, arg);
    }
    if remote.host.is_empty() {
        anyhow::bail!("No repository: pass --ssh, --local or -- COMMAND, or set [remote] in the config");
    }
    Ok(SessionTarget::Ssh(remote))
}

/// `[user@]host[:repository]`
fn apply_ssh_arg(remote: &mut RemoteConfig, arg: &str) {
    let (login, repository) = match arg.split_once(':') {
        Some((login, repository)) => (login, Some(repository)),
        None => (arg, None),
    };
    let host = match login.split_once('@') {
        Some((user, host)) => {
            remote.user = Some(user.to_string());
            host
        }
        None => login,
    };
    remote.host = host.to_string();
    if let Some(repository) = repository.filter(|r| !r.is_empty()) {
        remote.repository = PathBuf::from(repository);
    }
}
