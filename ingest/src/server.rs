use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::redis::RedisClient;
use crate::router;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::site::SiteGatekeeper;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client =
        Arc::new(RedisClient::new(config.redis_url).expect("failed to create redis client"));

    let gatekeeper = Arc::new(SiteGatekeeper::new(
        redis_client.clone(),
        Duration::from_secs(config.site_cache_ttl_secs),
    ));

    let limiter = Arc::new(RateLimiter::new(
        redis_client,
        config.rate_limit_per_ip,
        config.rate_limit_per_site,
        config.rate_limit_window_secs,
    ));

    let app = if config.print_sink {
        router::router(
            crate::time::SystemTime {},
            PrintSink {},
            gatekeeper,
            limiter,
            config.export_prometheus,
        )
    } else {
        let sink = KafkaSink::new(config.kafka).expect("failed to start Kafka sink");
        router::router(
            crate::time::SystemTime {},
            sink,
            gatekeeper,
            limiter,
            config.export_prometheus,
        )
    };

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .unwrap()
}
