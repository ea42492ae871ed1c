//! Piccolo server binary.
//!
//! Boot order: CLI and configuration, logging, data directory, instrument
//! configuration, shutters, spectrometers, scheduler, controller, then the
//! network interface. Failures before the serve loop are fatal and exit
//! non-zero.

use anyhow::Context;
use clap::{ArgAction, Parser};
use piccolo_server::config::{InstrumentConfig, LoggingConfig, ServerConfig};
use piccolo_server::control::Control;
use piccolo_server::datadir::DataDir;
use piccolo_server::hardware::{self, SpectrometerOpener};
use piccolo_server::resource::Site;
use piccolo_server::scheduler::Scheduler;
use piccolo_server::server;
use piccolo_server::shutter::ShutterBank;
use piccolo_server::spectrometer::SpectrometerBank;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "piccolo-server",
    about = "Piccolo instrument controller",
    version,
    disable_version_flag = true
)]
struct Cli {
    /// Server configuration file.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the data directory (disables mount handling).
    #[arg(short = 'd', long)]
    datadir: Option<String>,

    /// Override the bind address.
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Override the bind port.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cfg.debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cfg.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = term => {}
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = ServerConfig::new(cli.config.as_deref())
        .context("failed to read server configuration")?;
    if let Some(datadir) = cli.datadir {
        cfg.datadir.datadir = datadir;
        cfg.datadir.mount = false;
    }
    if let Some(bind) = cli.bind {
        cfg.coap.address = bind;
    }
    if let Some(port) = cli.port {
        cfg.coap.port = port;
    }
    if cli.debug {
        cfg.logging.debug = true;
    }
    init_logging(&cfg.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "piccolo server");

    let datadir = DataDir::new(&cfg.datadir).context("failed to open data directory")?;

    let instrument_cfg = InstrumentConfig::from_file(&datadir.join(&cfg.config))
        .context("failed to read instrument configuration")?;

    let shutters = ShutterBank::from_config(&instrument_cfg.channels)
        .context("failed to initialise shutters")?;

    let opener: Arc<SpectrometerOpener> = Arc::new(hardware::open_spectrometer);
    let spectrometers = SpectrometerBank::from_config(
        &instrument_cfg.spectrometers,
        shutters.names(),
        opener,
    )
    .await
    .context("failed to initialise spectrometers")?;

    let scheduler = Scheduler::open(&datadir.join("scheduler.sqlite"))
        .context("failed to open scheduler database")?;

    let control = Control::new(
        datadir.clone(),
        shutters.clone(),
        spectrometers.clone(),
        scheduler,
        &instrument_cfg.output,
    )?;

    let mut site = Site::new();
    site.mount("data_dir", datadir.resources());
    site.mount("shutter", shutters.resources());
    site.mount("spectrometer", spectrometers.resources());
    site.mount("control", control.resources());

    let addr: SocketAddr = format!("{}:{}", cfg.coap.address, cfg.coap.port)
        .parse()
        .context("invalid bind address")?;
    server::serve(Arc::new(site), addr, shutdown_signal()).await?;

    control.stop();
    spectrometers.stop_all();
    info!("shut down cleanly");
    Ok(())
}
