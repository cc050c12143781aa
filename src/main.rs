use std::{error::Error, process, str::FromStr, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
};
use tokio_util::sync::CancellationToken;

use onair::{
    announce::{AnnouncementDispatcher, LogAudience},
    config::{keys, MetricsConfig, Settings, StatusConfig},
    error,
    metrics::Timings,
    service::Service,
    signal::Signals,
    status::{self, LogStatus},
    store::ConfigStore,
    transport::WebSocketTransport,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Created on first save if it does not exist. Send SIGHUP or type
    /// `reload` to apply changes without restarting.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "ONAIR_CONFIG", default_value_t = String::from("onair.toml"))]
    config: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive, so this is quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("onair", level);
    }

    logger.init();
}

/// Commands typed on standard input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Command {
    Reload,
    Announce(bool),
    Status,
    Stop,
}

impl FromStr for Command {
    type Err = error::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["reload"] => Ok(Self::Reload),
            ["announce", "on"] => Ok(Self::Announce(true)),
            ["announce", "off"] => Ok(Self::Announce(false)),
            ["status"] => Ok(Self::Status),
            ["stop" | "quit"] => Ok(Self::Stop),
            _ => Err(error::Error::invalid_argument(format!(
                "unknown command \"{}\"; try reload, announce on|off, status or stop",
                line.trim()
            ))),
        }
    }
}

/// Status line and timing report tasks, restarted on every reload.
struct Reporters {
    shutdown: CancellationToken,
}

impl Reporters {
    fn spawn(settings: &Settings, service: &Service, timings: &Arc<Timings>) -> Self {
        let shutdown = CancellationToken::new();

        let current = service.clone();
        tokio::spawn(status::run(
            StatusConfig::from(&settings.status),
            move || current.last_song_text(),
            Arc::new(LogStatus),
            shutdown.clone(),
        ));

        let metrics = MetricsConfig::from(&settings.metrics);
        timings.set_enabled(metrics.enabled);
        if metrics.enabled {
            tokio::spawn(report_timings(
                metrics.log_interval,
                Arc::clone(timings),
                service.clone(),
                shutdown.clone(),
            ));
        }

        Self { shutdown }
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Logs and resets the timing buckets every `period`.
async fn report_timings(
    period: Duration,
    timings: Arc<Timings>,
    service: Service,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match timings.snapshot_and_reset() {
                    Ok(snapshot) => {
                        for timing in snapshot {
                            info!("timing {timing}");
                        }
                    }
                    Err(e) => warn!("could not read timings: {e}"),
                }
                info!(
                    "radio state={} has-song={}",
                    service.state(),
                    !service.last_song_text().is_empty()
                );
            }
        }
    }
}

/// Re-reads the configuration file and applies it.
fn reload(
    service: &Service,
    store: &ConfigStore,
    reporters: &mut Reporters,
    timings: &Arc<Timings>,
) {
    let settings = match store.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("not reloading {}: {e}", store.path().display());
            return;
        }
    };

    reporters.stop();
    *reporters = Reporters::spawn(&settings, service, timings);

    if let Err(e) = service.reload_from(store) {
        error!("not reloading {}: {e}", store.path().display());
    }
}

/// Runs a console command. Returns `false` when the process should exit.
fn execute(
    command: Command,
    service: &Service,
    store: &ConfigStore,
    reporters: &mut Reporters,
    timings: &Arc<Timings>,
) -> bool {
    match command {
        Command::Reload => {
            info!("reloading configuration");
            reload(service, store, reporters, timings);
        }
        Command::Announce(enabled) => {
            service.set_announcements_enabled(enabled);
            if let Err(e) = store.update(
                keys::SECTION,
                &[(keys::ANNOUNCEMENT_ENABLED, toml::Value::Boolean(enabled))],
            ) {
                warn!("could not save configuration: {e}");
            }
        }
        Command::Status => {
            let config = service.config();
            let song = service.last_song_text();
            info!(
                "state={} topic={} announcements={} song={}",
                service.state(),
                config.subscription_topic,
                if config.announcements_enabled { "on" } else { "off" },
                if song.is_empty() { "-" } else { song.as_str() },
            );
        }
        Command::Stop => return false,
    }

    true
}

/// Main application loop.
///
/// Runs until a shutdown signal or the `stop` command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be read at startup or the
/// signal handlers cannot be registered.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let store = ConfigStore::new(&args.config);
    let settings = store.settings()?;

    let (dispatcher, presenter) = AnnouncementDispatcher::new();
    tokio::spawn(presenter.run(Arc::new(LogAudience)));

    let timings = Arc::new(Timings::default());
    let service = Service::new(
        Arc::new(WebSocketTransport::default()),
        dispatcher,
        timings.clone(),
        Handle::current(),
    );

    let mut reporters = Reporters::spawn(&settings, &service, &timings);
    service.reload_from(&store)?;

    let mut signals = Signals::new()?;
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("{signal}: shutting down gracefully");
                    break;
                }
                info!("{signal}: reloading configuration");
                reload(&service, &store, &mut reporters, &timings);
            }

            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => {
                        if !execute(command, &service, &store, &mut reporters, &timings) {
                            info!("shutting down gracefully");
                            break;
                        }
                    }
                    Err(e) => warn!("{e}"),
                },
                Ok(None) => {
                    debug!("console closed");
                    console_open = false;
                }
                Err(e) => {
                    warn!("console closed: {e}");
                    console_open = false;
                }
            }
        }
    }

    service.stop();
    reporters.stop();
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
