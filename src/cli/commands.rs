use crate::config::DispatcherConfig;
use crate::dispatcher::{Dispatcher, ProcessDispatcher, ThreadedDispatcher};
use crate::handlers::EchoHandler;
use crate::logging::{init_logging_with_config, LogConfig};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the main thread checks for a shutdown signal
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Command-line interface for forkserve
#[derive(Parser)]
#[command(name = "forkserve")]
#[command(about = "HTTP connection dispatcher", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a dispatcher with echo handlers until SIGINT/SIGTERM
    Serve {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address and port to bind, overriding the configuration
        #[arg(long)]
        addr: Option<String>,

        /// Dispatch model
        #[arg(long, value_enum, default_value_t = Model::Threaded)]
        model: Model,

        /// URI prefix to mount an echo handler on (repeatable)
        #[arg(long = "echo", default_value = "/")]
        echo: Vec<String>,
    },
    /// Load and validate a configuration file
    CheckConfig {
        /// YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Dispatch model selected on the command line
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Model {
    /// One coroutine per connection
    Threaded,
    /// Pre-forked children receiving client sockets
    Process,
}

/// Parse the command line, set up logging and run the chosen command
///
/// # Errors
///
/// Returns an error if logging cannot be installed, the configuration is
/// invalid, or the dispatcher fails to start.
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env();
    if matches!(cli.command, Commands::Serve { model: Model::Process, .. }) && log_config.async_logging {
        // the background writer thread does not survive fork
        log_config.async_logging = false;
    }
    init_logging_with_config(&log_config)?;

    run(cli)
}

/// Run an already parsed command
///
/// # Errors
///
/// See [`run_cli`].
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve {
            config,
            addr,
            model,
            echo,
        } => {
            let config = load_config(config.as_deref(), addr.as_deref())?;
            serve(config, model, &echo)
        }
        Commands::CheckConfig { config } => {
            let loaded = load_config(Some(&config), None)?;
            println!("{} is valid", config.display());
            println!("{loaded:#?}");
            Ok(())
        }
    }
}

/// Defaults, then the YAML file, then `FORKSERVE_*`, then `--addr`
///
/// # Errors
///
/// Returns an error if the file cannot be loaded, `addr` is not
/// `HOST:PORT`, or the result fails validation.
pub fn load_config(path: Option<&Path>, addr: Option<&str>) -> Result<DispatcherConfig> {
    let mut config = match path {
        Some(path) => DispatcherConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => DispatcherConfig::default(),
    };
    config.apply_env();

    if let Some(addr) = addr {
        let (host, port) = split_addr(addr)?;
        config.host = host;
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn split_addr(addr: &str) -> Result<(String, u16)> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("Invalid address {addr:?}, expected HOST:PORT");
    };
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in address {addr:?}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Invalid address {addr:?}, host is empty");
    }
    Ok((host.to_string(), port))
}

fn serve(config: DispatcherConfig, model: Model, prefixes: &[String]) -> Result<()> {
    let shutdown = install_signal_flags()?;

    let dispatcher: Box<dyn Dispatcher> = match model {
        Model::Threaded => {
            may::config().set_stack_size(config.stack_size);
            Box::new(ThreadedDispatcher::new(config)?)
        }
        Model::Process => Box::new(ProcessDispatcher::new(config)?),
    };
    for prefix in prefixes {
        dispatcher
            .register(prefix, Arc::new(EchoHandler), false)
            .with_context(|| format!("Failed to mount echo handler on {prefix:?}"))?;
    }
    dispatcher.run().context("Failed to start dispatcher")?;
    info!(
        domain = %dispatcher.domain(),
        uris = ?dispatcher.core().classifier().uris(),
        "Serving; send SIGINT or SIGTERM to stop"
    );

    while !shutdown.load(Ordering::SeqCst) {
        if !dispatcher.is_running() {
            warn!("Dispatcher exited on its own");
            break;
        }
        std::thread::sleep(SIGNAL_POLL);
    }

    info!("Shutdown signal received, draining");
    dispatcher.stop(true);
    let metrics = dispatcher.metrics();
    info!(
        accepted = metrics.get_accepted_count(),
        dispatched = metrics.get_dispatched_count(),
        rejected = metrics.get_rejected_count(),
        reaped = metrics.get_reaped_count(),
        "Dispatcher stopped"
    );
    Ok(())
}

/// Raise a flag on SIGINT/SIGTERM
///
/// Flags rather than a signal iterator: a forked child inherits the
/// iterator's self-pipe and would forward its own SIGTERM to the parent.
fn install_signal_flags() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .with_context(|| format!("Failed to install handler for signal {signal}"))?;
    }
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::split_addr;

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("127.0.0.1:8080").unwrap(), ("127.0.0.1".to_string(), 8080));
        assert_eq!(split_addr("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(split_addr("localhost").is_err());
        assert!(split_addr(":80").is_err());
        assert!(split_addr("host:http").is_err());
    }
}
