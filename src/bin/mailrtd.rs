//! CLI entry point: load a config file, optionally override a few fields, boot the runtime,
//! wait for shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mailrt::config::Config;
use mailrt::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mailrtd", about = "Actor runtime daemon")]
struct Args {
    /// Path to a TOML config file (see `Config` for keys).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the worker thread count.
    #[arg(long)]
    workers: Option<usize>,

    /// Override the log level filter (e.g. "info", "mailrt=debug").
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("mailrtd: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    ignore_sigpipe();

    let pid_file = config.daemon.clone();
    if let Some(path) = &pid_file {
        if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
            eprintln!("mailrtd: failed to write pid file {path}: {e}");
            return ExitCode::FAILURE;
        }
    }

    let rt = Runtime::new(config);
    SIGHUP_RUNTIME.set(rt.clone()).ok();
    install_sighup_handler();

    if let Err(e) = rt.boot() {
        eprintln!("mailrtd: bootstrap failed: {e}");
        if let Some(path) = &pid_file {
            let _ = std::fs::remove_file(path);
        }
        return ExitCode::FAILURE;
    }

    wait_for_shutdown_signal();
    rt.shutdown();
    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }
    ExitCode::SUCCESS
}

/// `SIGPIPE` is ignored (spec §6): a worker or logger thread writing to a closed socket/pipe
/// should see `EPIPE` on the next write, not be killed by the default signal disposition.
fn ignore_sigpipe() {
    use nix::sys::signal::{self, SigHandler, Signal};
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

static SIGHUP_RUNTIME: std::sync::OnceLock<Arc<Runtime>> = std::sync::OnceLock::new();

/// SIGHUP asks the logger to reopen its file (spec §6); delivered to the timer thread, which
/// forwards it as a message on its next tick rather than doing file I/O from a signal handler.
fn install_sighup_handler() {
    use nix::sys::signal::{self, SigHandler, Signal};
    // SAFETY: the handler only sets a process-wide flag consulted by the timer thread; it
    // performs no allocation or locking that could deadlock inside a signal context.
    unsafe {
        let _ = signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_sighup));
    }
}

extern "C" fn handle_sighup(_: std::os::raw::c_int) {
    if let Some(rt) = SIGHUP_RUNTIME.get() {
        rt.timer.request_log_reopen();
    }
}

fn wait_for_shutdown_signal() {
    use nix::sys::signal::{self, SigHandler, Signal};
    use std::sync::atomic::{AtomicBool, Ordering};

    static STOP: AtomicBool = AtomicBool::new(false);
    extern "C" fn on_term(_: std::os::raw::c_int) {
        STOP.store(true, Ordering::SeqCst);
    }
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_term));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(on_term));
    }
    while !STOP.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
