use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    endpoints, limiter::RateLimiter, sinks::RowSink, site::SiteGatekeeper, time::TimeSource,
};

use crate::prometheus::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn RowSink + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub gatekeeper: Arc<SiteGatekeeper>,
    pub limiter: Arc<RateLimiter>,
}

async fn index() -> &'static str {
    "ingest"
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    S: RowSink + Send + Sync + 'static,
>(
    timesource: TZ,
    sink: S,
    gatekeeper: Arc<SiteGatekeeper>,
    limiter: Arc<RateLimiter>,
    metrics: bool,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
        gatekeeper,
        limiter,
    };

    // CORS is answered per-route: preflights are open to anyone, POST
    // responses only reflect an origin the gatekeeper accepted.
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/ingest/batch",
            post(endpoints::batch).options(endpoints::preflight),
        )
        .route(
            "/ingest/debug",
            post(endpoints::debug).options(endpoints::preflight),
        )
        .route(
            "/ingest/collect",
            post(endpoints::collect).options(endpoints::preflight),
        )
        .route("/ingest/health", get(endpoints::health))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(endpoints::reflect_backoff_origin))
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when ingest is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
