pub mod api;
pub mod config;
pub mod endpoints;
pub mod event;
pub mod limiter;
pub mod payload;
pub mod process;
pub mod prometheus;
pub mod redis;
pub mod router;
pub mod scrub;
pub mod server;
pub mod sinks;
pub mod site;
pub mod time;
pub mod utils;
