#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

mod app;
mod config;
mod log;

use anyhow::Context as _;
use camino::Utf8PathBuf;

use crate::app::App;
use crate::log::BridgeLog;

enum Action {
    ShowHelp,
    Run { config_path: Utf8PathBuf, debug: bool, quiet: bool },
}

fn main() -> anyhow::Result<()> {
    match parse_args()? {
        Action::ShowHelp => {
            print_help();
            Ok(())
        }
        Action::Run { config_path, debug, quiet } => run(&config_path, debug, quiet),
    }
}

fn parse_args() -> anyhow::Result<Action> {
    let mut config_path = Utf8PathBuf::from("config.toml");
    let mut debug = false;
    let mut quiet = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-file" => {
                let value = args.next().context("missing value for --config-file")?;
                config_path = Utf8PathBuf::from(value);
            }
            "--debug" => debug = true,
            "--quiet" => quiet = true,
            "--help" | "-h" => return Ok(Action::ShowHelp),
            other => anyhow::bail!("unrecognized argument `{other}` (see --help)"),
        }
    }

    Ok(Action::Run { config_path, debug, quiet })
}

fn print_help() {
    println!(
        r#"HELP:

    Run:
        dnstapir-bridge [--config-file <path>] [--debug] [--quiet]

    Options:
        --config-file <path>   Path to the TOML configuration file (default: config.toml)
        --debug                 Enable debug-level logging (overrides the `Debug` config key)
        --quiet                 Suppress info-level logging (overrides the `Quiet` config key)
"#
    );
}

fn run(config_path: &Utf8PathBuf, debug_flag: bool, quiet_flag: bool) -> anyhow::Result<()> {
    let mut config = config::load(config_path).context("couldn't load configuration")?;
    config.debug |= debug_flag;
    config.quiet |= quiet_flag;

    let _logger_guard =
        bridge_log::init::<BridgeLog>(&config.log_file, config.log_filter(), None).context("failed to set up logger")?;

    info!(version = env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: config::Config) -> anyhow::Result<()> {
    let mut app = App::build(config).context("couldn't build the bridge")?;
    app.initialize().context("couldn't initialize the bridge")?;
    let mut done_rx = app.run().await.context("couldn't start the bridge")?;

    tokio::select! {
        error = done_rx.recv() => {
            if let Some(error) = error {
                error!(error = format!("{error:#}"), "Bridge reported a fatal error");
            }
        }
        result = build_signals_fut() => {
            result?;
            info!("Shutdown signal received");
        }
    }

    app.stop().await;

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    tokio::select! {
        _ = terminate_signal.recv() => {}
        _ = quit_signal.recv() => {}
        _ = interrupt_signal.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
