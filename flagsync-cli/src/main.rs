use std::process;

use clap::{Args as ClapArgs, Parser, Subcommand};
use flagsync_lib::{ChangeKind, FlagStore, FlagSyncError, PatchDocument, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flagsync")]
#[command(version)]
#[command(about = "Local feature-flag cache kept in sync with a flag service", long_about = None)]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,

    /// Log filter used when RUST_LOG is not set
    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

/// Settings that override the config file and `FLAGSYNC_*` variables.
#[derive(ClapArgs, Debug)]
struct ConnectionArgs {
    /// Path to config file
    #[arg(short = 'c', long = "config", global = true, default_value = "flagsync.toml")]
    config: String,

    #[arg(long = "sdk-key", global = true)]
    sdk_key: Option<String>,

    #[arg(long = "api-token", global = true)]
    api_token: Option<String>,

    #[arg(long = "base-uri", global = true)]
    base_uri: Option<String>,

    #[arg(long = "stream-uri", global = true)]
    stream_uri: Option<String>,

    #[arg(short = 'p', long = "project", global = true)]
    project: Option<String>,

    #[arg(short = 'e', long = "env", global = true)]
    env: Option<String>,

    /// Load flags once instead of streaming
    #[arg(long = "no-stream", global = true)]
    no_stream: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream flags and print every change until interrupted
    Watch,
    List {
        /// Show version and on/off state
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    Get {
        flag_key: String,

        /// Read from the management API instead of the SDK endpoint
        #[arg(long = "remote")]
        remote: bool,
    },
    /// Turn a flag on or off in the configured environment
    Toggle {
        flag_key: String,

        #[arg(long = "on", conflicts_with = "off", required_unless_present = "off")]
        on: bool,

        #[arg(long = "off")]
        off: bool,

        #[arg(short = 'm', long = "comment")]
        comment: Option<String>,
    },
    /// Load flags once and print the Prometheus metrics
    Metrics,
}

/// Resolve settings from: CLI arg > env var > config file.
fn resolve_config(args: &ConnectionArgs) -> SyncConfig {
    let mut config = SyncConfig::load(&args.config);
    config.apply_env_overrides();

    if let Some(ref v) = args.sdk_key {
        config.sdk_key = Some(v.clone());
    }
    if let Some(ref v) = args.api_token {
        config.api_token = Some(v.clone());
    }
    if let Some(ref v) = args.base_uri {
        config.base_uri = v.clone();
    }
    if let Some(ref v) = args.stream_uri {
        config.stream_uri = v.clone();
    }
    if let Some(ref v) = args.project {
        config.project = Some(v.clone());
    }
    if let Some(ref v) = args.env {
        config.env = Some(v.clone());
    }
    if args.no_stream {
        config.stream = false;
    }
    config
}

fn fail(context: &str, err: FlagSyncError) -> ! {
    eprintln!("{}: {}", context, err);
    process::exit(1);
}

/// Build the cache and wait for the first snapshot, exiting on failure.
async fn start_store(config: SyncConfig) -> FlagStore {
    let flags = FlagStore::new(config);
    if let Err(FlagSyncError::Configuration(missing)) = flags.ensure_configured() {
        eprintln!(
            "Missing settings: {}. Use CLI flags, FLAGSYNC_* variables, or [flagsync] in the config file",
            missing
        );
        process::exit(1);
    }
    if let Err(e) = flags.start().await {
        flags.stop();
        fail("Failed to load flags", e);
    }
    flags
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }

    #[cfg(not(unix))]
    ctrl_c.await.ok();
}

async fn run_watch(config: SyncConfig) {
    let flags = start_store(config).await;
    println!("Watching {} flags", flags.list_flags().await.len());

    flags.subscribe(|event| {
        let at = event.at.format("%H:%M:%S");
        match &event.kind {
            ChangeKind::Replaced { count } => println!("[{}] snapshot: {} flags", at, count),
            ChangeKind::Updated { key, version } => {
                println!("[{}] updated {} v{}", at, key, version)
            }
            ChangeKind::Deleted { key, version } => {
                println!("[{}] deleted {} v{}", at, key, version)
            }
            ChangeKind::Cleared => println!("[{}] cache cleared", at),
        }
    });

    let mut state = flags.subscribe_state();
    let states = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            println!("connection: {}", current);
        }
    });

    shutdown_signal().await;
    println!("Shutdown signal received, closing stream...");
    flags.unsubscribe_all();
    flags.stop();
    states.abort();
}

async fn run_list(config: SyncConfig, verbose: bool) {
    let flags = start_store(config).await;
    if verbose {
        let all = flags.all_flags_metadata().await;
        let mut keys: Vec<&String> = all.keys().collect();
        keys.sort();
        for key in keys {
            let flag = &all[key];
            println!(
                "{} v{} {}",
                key,
                flag.version,
                if flag.on { "on" } else { "off" }
            );
        }
    } else {
        for key in flags.list_flags().await {
            println!("{}", key);
        }
    }
    flags.stop();
}

async fn run_get(config: SyncConfig, flag_key: &str, remote: bool) {
    let flag = if remote {
        let project = config.project.clone().unwrap_or_default();
        let flags = FlagStore::new(config);
        flags
            .get_remote_flag(&project, flag_key)
            .await
            .unwrap_or_else(|e| fail("Failed to read flag", e))
    } else {
        let flags = start_store(config).await;
        let found = flags.get_flag(flag_key).await;
        flags.stop();
        match found {
            Some(flag) => flag,
            None => {
                eprintln!("Flag {} not found", flag_key);
                process::exit(1);
            }
        }
    };

    match serde_json::to_string_pretty(&flag) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to encode flag: {}", e);
            process::exit(1);
        }
    }
}

async fn run_toggle(config: SyncConfig, flag_key: &str, on: bool, comment: Option<String>) {
    let (Some(project), Some(env)) = (config.project.clone(), config.env.clone()) else {
        eprintln!("Toggling needs both --project and --env");
        process::exit(1);
    };
    if config.api_token.is_none() {
        eprintln!("No API token specified. Use --api-token, set FLAGSYNC_API_TOKEN, or configure api_token");
        process::exit(1);
    }

    let mut patch = PatchDocument::toggle(&env, on);
    if let Some(comment) = comment {
        patch = patch.with_comment(&comment);
    }

    let flags = start_store(config).await;
    let result = flags.apply_patch(&project, flag_key, &patch).await;
    flags.stop();
    match result {
        Ok(flag) => println!(
            "✓ {} is now {} in {} (v{})",
            flag_key,
            if on { "on" } else { "off" },
            env,
            flag.version
        ),
        Err(e) => fail("Toggle failed", e),
    }
}

async fn run_metrics(config: SyncConfig) {
    let flags = start_store(config).await;
    print!("{}", flags.metrics().render());
    flags.stop();
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = resolve_config(&cli.conn);
    match cli.cmd {
        Command::Watch => run_watch(config).await,
        Command::List { verbose } => run_list(config, verbose).await,
        Command::Get { flag_key, remote } => run_get(config, &flag_key, remote).await,
        Command::Toggle {
            flag_key,
            on,
            off: _,
            comment,
        } => run_toggle(config, &flag_key, on, comment).await,
        Command::Metrics => run_metrics(config).await,
    }
}
