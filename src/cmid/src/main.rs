use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal;

use anyhow::Result;
use clap::Parser;

use cmi::io::IoConsumer;
use cmi::transport::Transport;
use cmi::CmiService;
use cmi_transport_tcp::TcpTransport;

pub mod config;
pub mod control;
pub mod logging;
pub mod volume;

use config::Config;
use control::Control;
use volume::Volume;

#[derive(Debug, Clone, Parser)]
#[command(name = "CMI Service")]
struct Opts {
    /// CMI config path
    #[arg(short, long, default_value = "cmi.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
    /// How long to wait for the peer link before negotiating alone, in ms
    #[arg(long, default_value_t = 2000)]
    connect_wait_ms: u64,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(sig: i32) {
    debug_assert!(sig == signal::SIGINT as i32 || sig == signal::SIGTERM as i32);
    TERMINATE.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    // load config
    let opts = Opts::parse();
    let config = Config::from_path(&opts.config)?;

    // log level from "CMI_LOG", defaulting to the config
    let _guards = logging::init_log(&config, !opts.no_ansi)?;

    let volume = Volume::new(config.volume.clone())?;
    let transport = TcpTransport::new(config.transport.clone())?;
    if !transport.wait_connected(Duration::from_millis(opts.connect_wait_ms)) {
        tracing::warn!("peer link not up yet, negotiating alone");
    }

    let service = CmiService::new(
        config.cmi.clone(),
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&volume) as Arc<dyn IoConsumer>,
    )?;
    let role = service.start()?;
    tracing::info!("SP {} running as {:?}", config.cmi.sp, role);

    // process Ctrl-C and termination
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_signal),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal::SIGINT, &sig_action) }?;
    unsafe { signal::sigaction(signal::SIGTERM, &sig_action) }?;

    // the Control now takes over
    let res = Control::new(Arc::clone(&service), &config.control)
        .and_then(|mut control| control.mainloop(&TERMINATE));

    service.destroy();
    transport.shutdown();
    volume.shutdown();
    res
}
