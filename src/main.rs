//! IPtProxy Rust - CLI Entry Point
//!
//! Runs the configured pluggable-transport backends until interrupted, or
//! checks the state location and probes single ports for diagnostics.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use iptproxy_rust::config::{Autostart, V2RayEndpoint};
use iptproxy_rust::environment::Provisioner;
use iptproxy_rust::port::is_port_available;
use iptproxy_rust::{Config, Supervisor, VERSION};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "iptproxy-rust")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Lifecycle supervisor for local pluggable-transport backends")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "iptproxy.yaml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long = "json-logs")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every backend listed under `autostart` and wait for Ctrl-C
    Run,
    /// Validate the configuration and provision the state location
    Check,
    /// Report whether a loopback port is free
    Probe { port: u16 },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("iptproxy-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("iptproxy_rust=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    init_logging(args.json_logs)?;

    if let Command::Probe { port } = args.command {
        let available = is_port_available(port).await;
        println!(
            "127.0.0.1:{} is {}",
            port,
            if available { "available" } else { "in use" }
        );
        return Ok(());
    }

    info!("IPtProxy Rust v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    match args.command {
        Command::Check => check(&config),
        Command::Run => run(config).await,
        Command::Probe { .. } => Ok(()),
    }
}

fn check(config: &Config) -> anyhow::Result<()> {
    let env = Provisioner::new(&config.state_location, false).provision()?;
    for (key, value) in env.vars() {
        println!("{}={}", key, value);
    }
    info!("Configuration test passed");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    if config.autostart.is_empty() {
        warn!("Nothing to start: autostart is empty");
        return Ok(());
    }

    let autostart = config.autostart.clone();
    let supervisor = match Supervisor::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize supervisor: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = start_all(&supervisor, autostart).await {
        error!("Startup failed: {}", e);
        supervisor.stop_all().await;
        std::process::exit(1);
    }

    for kind in supervisor.running() {
        println!("{}: {}", kind, supervisor.registry().ports(kind));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    supervisor.stop_all().await;
    Ok(())
}

async fn start_all(supervisor: &Supervisor, autostart: Autostart) -> iptproxy_rust::Result<()> {
    if let Some(lyrebird) = autostart.lyrebird {
        supervisor.start_lyrebird(lyrebird.options.clone()).await?;
        if let Some(creds) = lyrebird.obfs4_forwarder {
            supervisor
                .start_obfs4(creds.user, creds.password, lyrebird.options.clone())
                .await?;
        }
        if let Some(creds) = lyrebird.meek_forwarder {
            supervisor
                .start_meek(creds.user, creds.password, lyrebird.options)
                .await?;
        }
    }

    if let Some(options) = autostart.snowflake {
        supervisor.start_snowflake(options).await?;
    }

    if let Some(V2RayEndpoint {
        server_address,
        server_port,
        ws_path,
        id,
    }) = autostart.v2ray_ws
    {
        supervisor
            .start_v2ray_ws(server_address, server_port, ws_path.unwrap_or_default(), id)
            .await?;
    }
    if let Some(endpoint) = autostart.v2ray_srtp {
        supervisor
            .start_v2ray_srtp(endpoint.server_address, endpoint.server_port, endpoint.id)
            .await?;
    }
    if let Some(endpoint) = autostart.v2ray_wechat {
        supervisor
            .start_v2ray_wechat(endpoint.server_address, endpoint.server_port, endpoint.id)
            .await?;
    }

    if let Some(hysteria2) = autostart.hysteria2 {
        supervisor.start_hysteria2(hysteria2.server).await?;
    }

    Ok(())
}
