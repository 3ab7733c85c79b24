//! framecast: V4L2 capture, framebuffer display and raw TCP frame streaming

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use framecast::pipeline::{self, Mode};
use framecast::Config;

const USAGE: &str = "usage: framecast <serve|view|local|record|play> [config.toml]";

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framecast=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let mut args = std::env::args().skip(1);
    let mode: Mode = args
        .next()
        .ok_or_else(|| eyre!(USAGE))?
        .parse()?;
    let config_path = args.next().map(PathBuf::from);

    info!("framecast launching in {} mode...", mode);
    let config = Config::load(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(pipeline::run(mode, config));
    // a pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(Duration::from_millis(200));

    result?;
    info!("framecast shutting down");
    Ok(())
}
