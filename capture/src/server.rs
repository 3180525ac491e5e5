use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, Mutex};

use geoip::GeoIpReader;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::extractors::ClientIpExtractor;
use crate::limiter::RequestRateLimiter;
use crate::prometheus::{init_metrics, run_host_metrics, setup_metrics_recorder};
use crate::pruner::Pruner;
use crate::router::{admin_router, router, AppState};
use crate::salt::DailySalt;
use crate::saver::AsyncEventSaver;
use crate::store::{setup_pool, PgStore};
use crate::worker::Worker;

/// How long the teardown sequence may take before the process gives up
/// and exits non-zero.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// Wires the pipeline together and serves until `shutdown` resolves, then
/// tears down within [`SHUTDOWN_DEADLINE`]. In-flight batches inside the
/// worker are dropped at shutdown by design.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Don't install the global recorder when embedded in tests; a second
    // install panics.
    let prometheus = config.export_prometheus.then(setup_metrics_recorder);
    init_metrics(config.queue_size);
    if !config.disable_host_metrics {
        tokio::spawn(run_host_metrics());
    }

    let pool = setup_pool(&config).await?;

    let store = Arc::new(PgStore::new(pool.clone(), config.session_timeout_min));
    let salter = Arc::new(DailySalt::new(pool.clone()));

    let geo = GeoIpReader::open(Path::new(&config.geoip_file))?;
    let (worker, worker_handle, queue) = Worker::new(&config, store.clone(), Some(geo));
    let worker_join = tokio::spawn(worker.run());

    let saver = Arc::new(AsyncEventSaver::new(
        queue,
        salter,
        config.valid_event_names.0.clone(),
    ));

    let pruner = Pruner::new(store, config.prune_days, config.prune_check_hours);
    tokio::spawn(pruner.run());

    let limiter = NonZeroU32::new(config.request_rate_limit).map(RequestRateLimiter::new);
    if let Some(limiter) = &limiter {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.clean_state().await });
    }

    if let (Some(prometheus), false) = (prometheus, config.admin_listen.is_empty()) {
        let admin_addr: SocketAddr = config.admin_listen.parse()?;
        let admin = admin_router(prometheus);
        tokio::spawn(async move {
            info!("admin listening on {admin_addr}");
            match TcpListener::bind(admin_addr).await {
                Ok(listener) => {
                    if let Err(err) = axum::serve(listener, admin).await {
                        error!(error = %err, "admin server error");
                    }
                }
                Err(err) => error!(error = %err, "could not bind admin listener"),
            }
        });
    }

    let state = AppState {
        saver,
        extractor: ClientIpExtractor::new(config.ip_extractor, config.trusted_proxies.clone()),
        limiter,
        root_redirect: config.root_redirect.clone(),
    };
    let app = router(
        state,
        config.body_max_size,
        &config.static_dir,
        config.static_cache_max_age,
    );

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    // Teardown, bounded by a hard deadline. Each step records itself so a
    // timeout can name the laggard.
    let step = Arc::new(Mutex::new("worker shutdown"));
    let teardown = {
        let step = Arc::clone(&step);
        async move {
            worker_handle.shutdown();
            let _ = worker_join.await;
            *step.lock().expect("step lock") = "pool close";
            pool.close().await;
            *step.lock().expect("step lock") = "done";
        }
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, teardown).await.is_err() {
        let pending = *step.lock().expect("step lock");
        warn!("shutdown timed out at step: {pending}");
        std::process::exit(1);
    }
    info!("shutdown complete");
    Ok(())
}
