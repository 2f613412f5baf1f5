use anyhow::Context;
use clap::Parser;
use log::{error, info};
use packet_lens::{capture::PcapEngine, settings::Config, Result, Supervisor};
use std::process;

#[derive(Parser)]
#[command(name = "packet-lens")]
#[command(about = "Streams a live summary of captured packets to WebSocket viewers")]
struct Cli {
    #[arg(short, long, help = "Network interface to capture on (default: primary interface)")]
    interface: Option<String>,

    #[arg(short, long, help = "Configuration file path")]
    config: Option<String>,

    #[arg(short, long, help = "Port to listen on for viewers")]
    port: Option<u16>,

    #[arg(short, long, help = "Address to bind the viewer listener to")]
    bind: Option<String>,

    #[arg(short, long, help = "Enable debug logging")]
    debug: bool,

    #[arg(long, help = "List capture interfaces and exit")]
    list_interfaces: bool,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };

        if let Some(interface) = &self.interface {
            config.capture.interface = Some(interface.clone());
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;

    let source = PcapEngine::open(&config.capture).context("Cannot start packet capture")?;
    let supervisor = Supervisor::bind(config).await?;

    info!("packet-lens {} started", env!("CARGO_PKG_VERSION"));
    supervisor.run(source, shutdown_signal()).await?;
    Ok(())
}

fn list_interfaces() -> Result<()> {
    let default = PcapEngine::default_interface().ok();
    for device in PcapEngine::list_devices()? {
        let marker = if default.as_deref() == Some(device.name.as_str()) { "*" } else { " " };
        match &device.desc {
            Some(desc) => println!("{} {} ({})", marker, device.name, desc),
            None => println!("{} {}", marker, device.name),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let result = if cli.list_interfaces {
        list_interfaces()
    } else {
        run(cli).await
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("packet-lens: {:#}", e);
        process::exit(1);
    }
}
