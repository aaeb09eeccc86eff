use std::net::SocketAddr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    pub redis_url: String,

    /// TTL of the in-process site validation cache
    #[envconfig(default = "300")]
    pub site_cache_ttl_secs: u64,

    /// Requests per window for one client IP across all sites
    #[envconfig(default = "1000")]
    pub rate_limit_per_ip: u64,

    /// Requests per window for one (client IP, site) pair
    #[envconfig(default = "600")]
    pub rate_limit_per_site: u64,

    #[envconfig(default = "60")]
    pub rate_limit_window_secs: u64,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    pub kafka_hosts: String,
    #[envconfig(default = "ingest_analytics_rows")]
    pub kafka_analytics_topic: String,
    #[envconfig(default = "ingest_debug_rows")]
    pub kafka_debug_topic: String,
    #[envconfig(default = "ingest_form_rows")]
    pub kafka_forms_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}
