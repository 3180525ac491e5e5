use envconfig::Envconfig;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use capture::config::{Config, LogFormat};
use capture::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

fn setup_tracing(config: &Config) {
    let default_level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match config.log_format {
        LogFormat::Json => {
            let log_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(log_layer).init();
        }
        LogFormat::Text => {
            let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
            tracing_subscriber::registry().with(log_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env()?;
    setup_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting capture service"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    serve(config, listener, shutdown()).await
}
