use clap::Parser;
use event_gateway::broker::MemoryBroker;
use event_gateway::{http, Backends, Config, Error, Gateway, LoggingHandler, Result, SessionState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "event-gateway")]
#[command(about = "HTTP event gateway publishing to and consuming from Kafka", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Config file (KAFKA_BROKERS, KAFKA_TOPIC, KAFKA_GROUP_ID and PORT are read when omitted)"
    )]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Run against an in-process broker instead of Kafka")]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting event-gateway");

    let loaded = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path)
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env()
        }
    };
    let config = match loaded {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        group_id = %config.consumer.group_id,
        initial_offset = ?config.consumer.initial_offset,
        port = config.server.port,
        in_memory = args.in_memory,
        "Configuration summary"
    );

    let backends = if args.in_memory {
        warn!("Using the in-process broker; events are lost on exit");
        Backends::memory(&MemoryBroker::new(), &config)
    } else {
        Backends::kafka(&config).await?
    };

    let gateway = Arc::new(Gateway::start(config.clone(), backends, Arc::new(LoggingHandler)).await?);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Listening for requests");

    axum::serve(listener, http::router(Arc::clone(&gateway)))
        .with_graceful_shutdown(shutdown_signal(gateway.watch_session()))
        .await?;

    let report = gateway.shutdown(config.shutdown_timeout()).await;
    for warning in &report.warnings {
        warn!("Shutdown warning: {}", warning);
    }

    if let SessionState::Failed { reason } = gateway.session_state() {
        error!("Exiting after consumer group failure: {}", reason);
        return Err(Error::Coordination { message: reason });
    }

    info!("event-gateway stopped");
    Ok(())
}

async fn shutdown_signal(mut session: watch::Receiver<SessionState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    let session_failed = async {
        // Also resolves if the session task is gone.
        let _ = session
            .wait_for(|state| matches!(state, SessionState::Failed { .. }))
            .await;
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = session_failed => error!("Consumer group session failed, shutting down"),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("event_gateway=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("event_gateway=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
