use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use keel_persistence::{FileConfigStore, RecoveryPolicy};
use keel_server::ServerConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "keel-server", about = "keel process controller and configuration server")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "KEEL_HOST")]
    host: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "KEEL_PORT")]
    port: Option<u16>,

    /// maximum number of concurrent control sessions
    #[arg(long, env = "KEEL_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// seconds a session may wait for a command (0 = never time out)
    #[arg(long, env = "KEEL_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// directory holding cluster configuration versions and the index
    #[arg(long, env = "KEEL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// serve the clusters that load and mark the rest unavailable,
    /// instead of refusing to start on a damaged store
    #[arg(long, env = "KEEL_DEGRADED")]
    degraded: bool,

    /// program launched by `start node`
    #[arg(long, env = "KEEL_NODE_PROGRAM")]
    node_program: Option<String>,

    #[command(subcommand)]
    command: Option<Admin>,
}

/// Offline store administration. These take the store's directory lock,
/// so they fail while a server is running on the same directory.
#[derive(Subcommand)]
enum Admin {
    /// install a configuration file as version 1 of a cluster
    Bootstrap {
        #[arg(long)]
        config_file: PathBuf,
        #[arg(long)]
        config_dir: PathBuf,
        #[arg(long)]
        cluster_id: u32,
        #[arg(long)]
        name: String,
        /// replace an existing cluster and its history
        #[arg(long)]
        force: bool,
    },

    /// remove a cluster from the index and delete its versions
    Remove {
        #[arg(long)]
        config_dir: PathBuf,
        #[arg(long)]
        cluster_id: u32,
    },

    /// list the version files of a cluster
    History {
        #[arg(long)]
        config_dir: PathBuf,
        #[arg(long)]
        cluster_id: u32,
    },

    /// delete orphaned versions, stale temp files and old indexes
    Gc {
        #[arg(long)]
        config_dir: PathBuf,
        /// index files to keep
        #[arg(long, default_value_t = 2)]
        keep_indexes: usize,
    },
}

/// Applies CLI overrides to a `ServerConfig`. Only `Some` values from the
/// CLI args take effect, keeping the resolution order of defaults, then
/// the TOML file, then env vars and flags.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(n) = args.max_connections {
        cfg.max_connections = n;
    }
    if let Some(secs) = args.idle_timeout_secs {
        cfg.idle_timeout_secs = secs;
    }
    if let Some(ref dir) = args.config_dir {
        cfg.store.config_dir = dir.clone();
    }
    if args.degraded {
        cfg.store.degraded = true;
    }
    if let Some(ref program) = args.node_program {
        cfg.controller.program = Some(program.clone());
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn open_store(dir: &Path) -> FileConfigStore {
    match FileConfigStore::open(dir, RecoveryPolicy::Degraded) {
        Ok((store, _)) => store,
        Err(e) => exit_err(format!("error: {e}")),
    }
}

fn run_admin(command: Admin) {
    match command {
        Admin::Bootstrap {
            config_file,
            config_dir,
            cluster_id,
            name,
            force,
        } => {
            if let Err(e) =
                keel_persistence::bootstrap(&config_file, &config_dir, cluster_id, &name, force)
            {
                exit_err(format!("error: bootstrap failed: {e}"));
            }
            info!(cluster_id, %name, "bootstrapped version 1");
        }
        Admin::Remove {
            config_dir,
            cluster_id,
        } => {
            let store = open_store(&config_dir);
            match store.remove_cluster(cluster_id) {
                Ok(files) => info!(cluster_id, files, "cluster removed"),
                Err(e) => exit_err(format!("error: {e}")),
            }
        }
        Admin::History {
            config_dir,
            cluster_id,
        } => {
            let store = open_store(&config_dir);
            let history = store
                .history(cluster_id)
                .unwrap_or_else(|e| exit_err(format!("error: {e}")));
            for v in history {
                let mark = if v.committed { "" } else { " (uncommitted)" };
                println!(
                    "v{} created_ms={} bytes={}{mark}",
                    v.version, v.created_ms, v.payload_len
                );
            }
        }
        Admin::Gc {
            config_dir,
            keep_indexes,
        } => {
            let store = open_store(&config_dir);
            match store.garbage_collect(keep_indexes) {
                Ok(report) => info!(
                    versions = report.removed_versions,
                    indexes = report.removed_indexes,
                    tmp = report.removed_tmp,
                    "garbage collection done"
                ),
                Err(e) => exit_err(format!("error: {e}")),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info".into()),
        )
        .init();

    let mut args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("error: {e}")),
        }
    }

    if let Some(command) = args.command.take() {
        run_admin(command);
        return;
    }

    let mut cfg = match args.config {
        Some(ref path) => {
            ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(format!("error: {e}")))
        }
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if let Err(e) = keel_server::run(cfg).await {
        exit_err(format!("error: {e}"));
    }
}
