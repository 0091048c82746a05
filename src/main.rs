//! CLI for mqrelay
//!
//! `mqrelay <frontend-host> <frontend-port> <backend-host> <backend-port>`
//! `mqrelay <frontend-host> <backend-host>`

use std::process::ExitCode;

use clap::Parser;
use clap::error::{ContextKind, ErrorKind};
use mqrelay::config::{BindConfig, BindDefaults, Settings, load_config, resolve};
use mqrelay::relay;
use mqrelay::transport::bind_and_run;
use mqrelay::utils::{RelayError, logging};
use tokio::sync::watch;
use tracing::{error, info};

const USAGE: &str = "mqrelay <bind frontend> <port frontend> <bind backend> <port backend>\n       \
                     mqrelay <bind frontend> <bind backend>";

#[derive(Parser, Debug)]
#[command(name = "mqrelay", version, about = "Publish/subscribe forwarding relay")]
#[command(override_usage = USAGE)]
struct Args {
    /// Frontend and backend hosts, each optionally followed by its port
    #[arg(value_name = "ENDPOINT", allow_negative_numbers = true)]
    endpoints: Vec<String>,

    /// Log level (error, warn, info, debug, trace); overrides the settings file
    #[arg(long, env = "MQRELAY_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match usage_error(&e) {
            Some(err) => return fail(&err),
            None => e.exit(),
        },
    };

    let bind = match resolve(&args.endpoints, &BindDefaults::default()) {
        Ok(bind) => bind,
        Err(e) => return fail(&e),
    };

    let settings = match load_config()
        .map_err(RelayError::from)
        .and_then(|s| s.validate().map(|()| s))
    {
        Ok(settings) => settings,
        Err(e) => return fail(&e),
    };

    logging::init(args.log_level.as_deref().unwrap_or(&settings.logging.level));

    match run(bind, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

/// Map a clap failure onto the relay's argument errors. `None` for help and
/// version output, which clap prints itself.
fn usage_error(e: &clap::Error) -> Option<RelayError> {
    match e.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => None,
        ErrorKind::MissingRequiredArgument | ErrorKind::TooFewValues => {
            Some(RelayError::MissingArguments)
        }
        kind => {
            let detail = match e.get(ContextKind::InvalidArg) {
                Some(arg) => format!("unexpected argument '{arg}'"),
                None => kind.as_str().unwrap_or("unrecognized arguments").to_string(),
            };
            Some(RelayError::InvalidArguments(detail))
        }
    }
}

/// Print the diagnostic (plus usage for argument errors) and pick the exit code.
fn fail(e: &RelayError) -> ExitCode {
    eprintln!("Error: {e}.");
    if e.is_usage_error() {
        eprintln!("Usage: {USAGE}");
    }
    ExitCode::from(e.exit_code())
}

async fn run(bind: BindConfig, settings: Settings) -> Result<(), RelayError> {
    println!(
        "Binding frontend to {} and backend to {}...",
        bind.frontend_url(),
        bind.backend_url()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received. Stopping relay.");
        let _ = shutdown_tx.send(true);
    });

    bind_and_run(&bind, relay::shared(), settings.relay, shutdown_rx).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
