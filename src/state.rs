use std::sync::Arc;
use crate::admit::Admitter;
use crate::rate_limit::Limiter;
// app's shared state

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<Limiter>,  // only shared mutable state, behind its own lock
    pub admitter: Arc<Admitter>,
}
