use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref KNOCK_REQUESTS: Counter =
        register_counter!("knock_requests_total", "Total number of knock requests").unwrap();
    pub static ref KNOCK_ADMITTED: Counter =
        register_counter!("knock_admitted_total", "Knocks that ended up in an allow-set").unwrap();
    pub static ref KNOCK_DENIED: Counter =
        register_counter!("knock_denied_total", "Knocks refused by the rate limiter or blacklist").unwrap();
    pub static ref KNOCK_FAILED: Counter =
        register_counter!("knock_failed_total", "Knocks where the allow-set insertion failed").unwrap();
    pub static ref ADMIT_LATENCY: Histogram = register_histogram!(
        "knock_admit_latency_seconds",
        "Time spent inserting an address into the allow-set"
    )
    .unwrap();
    pub static ref BLACKLIST_SIZE: Gauge =
        register_gauge!("knock_blacklist_size", "Number of blacklisted addresses").unwrap();
    pub static ref TRACKED_ADDRESSES: Gauge =
        register_gauge!("knock_tracked_addresses", "Addresses with a live rate limit window").unwrap();
}

// Prometheus text format of everything registered above
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
