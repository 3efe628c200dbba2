use axum::http::StatusCode;
use axum::response::IntoResponse;

// Say as little as possible to anyone scanning the gate
pub async fn default_handler() -> &'static str {
    "."
}

pub async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, ".")
}
