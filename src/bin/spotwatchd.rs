//! spotwatchd - parking spot occupancy daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by SPOTWATCH_CONFIG, then SPOTWATCH_* env)
//! 2. Starts the parking service and its reservation scheduler
//! 3. Optionally sets up an initial scene from the config file
//! 4. Serves setup, reservation, status and the two MJPEG streams over HTTP
//! 5. Stops every background task on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spotwatch::{
    api::{ApiConfig, ApiServer},
    BackendRegistry, ParkingService, SpotwatchConfig, StopSignal,
};

#[derive(Parser, Debug)]
#[command(name = "spotwatchd", about = "Parking spot occupancy daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "SPOTWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file and SPOTWATCH_API_ADDR
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = SpotwatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.api_addr = addr;
    }

    let backends = BackendRegistry::from_settings(&cfg.detector)?;
    log::info!("detector backends available: {}", backends.list().join(", "));
    let service = Arc::new(ParkingService::start(cfg.clone(), backends)?);

    if let Some(setup) = &cfg.setup {
        let summary = service.setup(setup)?;
        log::info!(
            "initial setup: {} spots on {}",
            summary.spots,
            summary.source
        );
    } else {
        log::info!("no initial setup configured; waiting for POST /setup");
    }

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        service.clone(),
    )
    .spawn()?;

    let shutdown = StopSignal::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.stop()).expect("error setting Ctrl-C handler");

    log::info!("spotwatchd running (Ctrl-C to stop)");
    while !shutdown.wait_timeout(Duration::from_secs(60)) {
        let status = service.status();
        log::debug!(
            "heartbeat: {} spots, engine running={}",
            status.len(),
            service.is_running()
        );
    }

    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    service.shutdown()?;
    Ok(())
}
