pub trait TimeSource {
    // Return an ISO timestamp
    fn current_time(&self) -> String;

    // Unix timestamp in milliseconds, used for received_at rows
    fn current_millis(&self) -> i64;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let time = time::OffsetDateTime::now_utc();

        time.format(&time::format_description::well_known::Iso8601::DEFAULT)
            .expect("failed to iso8601 format timestamp")
    }

    fn current_millis(&self) -> i64 {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}
