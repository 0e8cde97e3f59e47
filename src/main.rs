use fluux_component::component::{
    parse_endpoint, ComponentConfig, ComponentEvents, ConnectionState, MessageEvent, OutgoingMessage,
    PresenceEvent, QosLevel, XmppComponent, DEFAULT_COMPONENT_PORT,
};
use fluux_component::ComponentError;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Event sink of the stand-alone binary: echoes chat messages back to their sender
/// and accepts every subscription request.
struct EchoEvents;

impl ComponentEvents for EchoEvents {
    fn on_state_changed(&self, state: ConnectionState) {
        info!(state = %state, "Component state");
    }

    fn on_connection_error(&self, error: &ComponentError) {
        warn!(error = %error, "Component connection lost");
    }

    fn on_chat_message(&self, component: &XmppComponent, message: &MessageEvent) {
        let Some(body) = message.body.as_deref() else {
            return;
        };
        let reply = OutgoingMessage::chat(message.to.clone(), message.from.clone(), body);
        if let Err(e) = component.send_message(QosLevel::Unacknowledged, &reply, None) {
            warn!(to = %message.from, error = %e, "Echo not sent");
        }
    }

    fn on_presence_subscribe(&self, component: &XmppComponent, presence: &PresenceEvent) {
        if let Err(e) = component.accept_subscription(presence) {
            warn!(from = %presence.from, error = %e, "Could not accept subscription");
        }
    }

    fn on_presence_unsubscribe(&self, component: &XmppComponent, presence: &PresenceEvent) {
        if let Err(e) = component.accept_unsubscription(presence) {
            warn!(from = %presence.from, error = %e, "Could not accept unsubscription");
        }
    }
}

fn print_usage() {
    eprintln!("Fluux Component v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-component --config=PATH [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --config=PATH     JSON component configuration");
    eprintln!("      --server=HOST:PORT");
    eprintln!("                        Override the server component endpoint");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr");
    eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP packet content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform data dir)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG                Override log filter (e.g. RUST_LOG=debug)");
    eprintln!("  FLUUX_COMPONENT_SECRET  Shared secret, overrides the configuration file");
}

fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        std::process::exit(0);
    }

    // --verbose / -v (no XMPP packets) or --verbose=xmpp (with packets)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let verbose = verbose_level.is_some();

    let log_file_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--log-file=").map(|s| s.to_string()));
    let config_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--config=").map(|s| s.to_string()));
    let server = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--server=").map(|s| s.to_string()));

    let Some(config_path) = config_path else {
        print_usage();
        std::process::exit(2);
    };

    let log_dir = if let Some(ref path) = log_file_path {
        std::path::PathBuf::from(path)
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("fluux-component")
            .join("logs")
    };

    // Always log to a daily file; stderr only when asked for.
    // The guard must outlive the runtime or buffered lines are lost.
    let _guard = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let rust_log = std::env::var("RUST_LOG").is_ok();
        let file_filter = if rust_log {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("fluux_component=info,info")
        };
        let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-component.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let stderr_layer = if verbose || rust_log {
            let stderr_filter = if rust_log {
                EnvFilter::from_default_env()
            } else if verbose_level == Some("xmpp") {
                EnvFilter::new("fluux_component=debug,info")
            } else {
                EnvFilter::new("fluux_component=info,info")
            };
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();

        eprintln!("Log file: {}", log_dir.display());
        guard
    };

    let mut config = match ComponentConfig::from_json_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Ok(secret) = std::env::var("FLUUX_COMPONENT_SECRET") {
        config.shared_secret = secret;
    }
    if let Some(server) = server {
        match parse_endpoint(&server, DEFAULT_COMPONENT_PORT) {
            Some(endpoint) => {
                config.host = endpoint.host;
                config.port = endpoint.port;
            }
            None => {
                eprintln!("Invalid --server value: {server}");
                std::process::exit(2);
            }
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        sub_domain = %config.component_sub_domain,
        "Starting component"
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start async runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(config));
    drop(runtime);
    drop(_guard);
    std::process::exit(code);
}

async fn run(config: ComponentConfig) -> i32 {
    let component = match XmppComponent::builder(config).events(Arc::new(EchoEvents)).build() {
        Ok(component) => component,
        Err(e) => {
            error!(error = %e, "Could not create component");
            return 1;
        }
    };
    component.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not wait for shutdown signal");
    }
    info!("Shutting down");
    component.shutdown().await;
    0
}
