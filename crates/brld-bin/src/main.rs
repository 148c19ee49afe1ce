//! braild entrypoint.

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

mod keymap;
mod runtime;

use runtime::DaemonRuntime;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "braild", version, about = "Braille display daemon")]
struct Args {
    /// Configuration file path (overrides discovery of `braild.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Device identifier, e.g. `serial:/dev/ttyUSB0` (overrides config).
    #[arg(long = "device")]
    device: Option<String>,
    /// API host spec, e.g. `:0` or `annex:3` (overrides config).
    #[arg(long = "api-host")]
    api_host: Option<String>,
    /// Directory for `braild.log`.
    #[arg(long = "log-dir", default_value = ".")]
    log_dir: PathBuf,
}

fn configure_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(log_dir, "braild.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => {
            // Global subscriber already installed; drop the guard so the
            // writer thread shuts down.
            None
        }
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(&args.log_dir);
    install_panic_hook();
    info!(target: "runtime", "startup");

    let mut config = core_config::load_from(args.config.clone())?;
    if let Some(device) = args.device {
        config.file.braille.device = device;
    }
    if let Some(host) = args.api_host {
        config.file.api.host = host;
    }
    info!(
        target: "runtime.startup",
        device = config.file.braille.device.as_str(),
        api_host = config.file.api.host.as_str(),
        config = config.source.as_ref().map(|p| p.display().to_string()).as_deref(),
        "bootstrap_complete"
    );

    let runtime = DaemonRuntime::new(config)?;
    runtime.run()
}
