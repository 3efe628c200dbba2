mod fallback;
mod knock;
mod metrics;

pub use fallback::{default_handler, not_found_handler};
pub use knock::knock_handler;
pub use metrics::metrics_handler;
