//! `mirrorfsd`, the server binary.
//!
//! Loads the configuration named by `-c`, opens the export, waits for the
//! queue peer on the bring-up transport and pumps requests until a signal
//! or peer disconnect asks for shutdown.

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;
use nix::sys::signal::{signal, SigHandler, Signal};

use mirrorfs::config::Config;
use mirrorfs::hal::{Completion, Endpoint, PollPool};
use mirrorfs::server::MirrorFs;

/// The virtio-fs local-mirror file server.
#[derive(Debug, Parser)]
#[command(name = "mirrorfsd", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', value_name = "CONFIG")]
    config: PathBuf,
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    SIGNALLED.store(true, Ordering::Release);
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("mirrorfsd: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::load(&cli.config)?;

    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(on_signal))?;
        signal(Signal::SIGTERM, SigHandler::Handler(on_signal))?;
    }

    let endpoint = Arc::new(Endpoint::accept(&config.hal.socket)?);
    let completer: Arc<dyn Completion> = Arc::clone(&endpoint) as Arc<dyn Completion>;
    let server = MirrorFs::new(&config.local_mirror, completer)?;

    let device = 0;
    let shutdown = Arc::new(AtomicBool::new(false));
    let pool = PollPool::spawn(
        config.local_mirror.poll_nthreads,
        device,
        endpoint,
        Arc::clone(&server),
        Arc::clone(&shutdown),
    )?;

    while !SIGNALLED.load(Ordering::Acquire) && !shutdown.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
    }
    info!("shutting down");

    // stop pulling requests, drain in-flight completions, then detach
    pool.stop();
    pool.join();
    server.shutdown();
    server.unregister_device(device);
    Ok(())
}
