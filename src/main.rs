//! Miracast source daemon binary
//!
//! Parses the command line, sets up logging and process attributes, wipes
//! and recreates the runtime directory, then brings the service controller
//! up and logs its notifications until a termination signal arrives. The
//! first signal starts a clean shutdown with a short grace period; a second
//! signal exits immediately.

use clap::{Arg, ArgAction, Command};
use miracastd::daemon::{Config, MiracastService, ServiceEvent};
use miracastd::{RUNTIME_PATH, VERSION_MAJOR, VERSION_MINOR};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Nice value used while casting; the encoder path is latency sensitive.
const PROCESS_PRIORITY_URGENT_DISPLAY: i32 = -8;

fn cli() -> Command {
    Command::new("miracastd")
        .about("Miracast source daemon")
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debugging mode")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .help("Show version information and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("interface")
                .short('i')
                .long("interface")
                .value_name("INTERFACE")
                .help("P2P network interface to drive"),
        )
}

fn parse_options<I, T>(args: I) -> Result<Config, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = cli().try_get_matches_from(args)?;

    let mut config = Config::default();
    config.debug = matches.get_flag("debug");
    config.print_version = matches.get_flag("version");
    if let Some(interface) = matches.get_one::<String>("interface") {
        config.interface = interface.clone();
    }
    Ok(config)
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Become a subreaper of our children and raise the process priority; the
/// daemon forks the supplicant and DHCP daemons and feeds a display.
fn apply_process_attributes() {
    unsafe {
        if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong) < 0 {
            warn!("failed to become a subreaper of our children");
        }
        if libc::setpriority(libc::PRIO_PROCESS as _, 0, PROCESS_PRIORITY_URGENT_DISPLAY) < 0 {
            debug!("failed to raise process priority");
        }
    }
}

/// Wipe and recreate the runtime directory.
fn create_runtime_directory() {
    let path = std::path::Path::new(RUNTIME_PATH);
    if path.is_dir() {
        if let Err(err) = std::fs::remove_dir_all(path) {
            warn!("failed to clear runtime directory {}: {}", RUNTIME_PATH, err);
        }
    }
    if let Err(err) = std::fs::create_dir_all(path) {
        warn!("failed to create runtime directory {}: {}", RUNTIME_PATH, err);
    }
}

fn log_service_event(event: ServiceEvent) {
    match event {
        ServiceEvent::Changed => debug!("service state changed"),
        ServiceEvent::DeviceFound(device) => {
            info!(address = %device.address(), name = device.name(), "device found")
        }
        ServiceEvent::DeviceLost(device) => {
            info!(address = %device.address(), "device lost")
        }
        ServiceEvent::DeviceChanged(device) => {
            debug!(address = %device.address(), state = %device.state(), "device changed")
        }
        ServiceEvent::StateChanged(state) => info!(%state, "session state changed"),
        ServiceEvent::SourceReady(endpoint) => {
            info!(%endpoint, "session connected, RTSP source endpoint ready")
        }
        ServiceEvent::SourceClosed => info!("session ended, RTSP source endpoint closed"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match parse_options(std::env::args_os()) {
        Ok(config) => config,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return;
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    if config.print_version {
        println!("{}.{}", VERSION_MAJOR, VERSION_MINOR);
        return;
    }

    init_logging(config.debug);
    info!(
        "starting miracastd {}.{} on {}",
        VERSION_MAJOR, VERSION_MINOR, config.interface
    );

    apply_process_attributes();
    create_runtime_directory();

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to install SIGINT handler: {}", err);
            std::process::exit(1);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("failed to install SIGTERM handler: {}", err);
            std::process::exit(1);
        }
    };

    let shutdown_grace = config.shutdown_grace();
    let (controller, mut observers) = MiracastService::spawn(config);

    if let Err(err) = controller.set_enabled(true).await {
        error!("failed to enable the service: {}", err);
    }

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            event = observers.recv() => match event {
                Some(event) => log_service_event(event),
                None => break,
            },
        }
    }

    info!("shutting down");

    // Give shutdown jobs a small window; a second signal overrides it.
    tokio::select! {
        _ = async {
            controller.shutdown().await;
            tokio::time::sleep(shutdown_grace).await;
        } => {}
        _ = sigint.recv() => debug!("second signal, exiting immediately"),
        _ = sigterm.recv() => debug!("second signal, exiting immediately"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let config = parse_options(["miracastd"]).unwrap();
        assert!(!config.debug);
        assert!(!config.print_version);
        assert_eq!(config.interface, "p2p0");
    }

    #[test]
    fn test_debug_and_version_flags() {
        let config = parse_options(["miracastd", "--debug"]).unwrap();
        assert!(config.debug);

        let config = parse_options(["miracastd", "-v"]).unwrap();
        assert!(config.print_version);
    }

    #[test]
    fn test_interface_override() {
        let config = parse_options(["miracastd", "-i", "p2p1"]).unwrap();
        assert_eq!(config.interface, "p2p1");
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert!(parse_options(["miracastd", "--bogus"]).is_err());
    }
}
