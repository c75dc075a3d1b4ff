//! Request-id middleware and task-local propagation.
//!
//! Every request gets an id: the inbound `X-Request-ID` header when the
//! client supplied one, a fresh UUIDv4 otherwise. The id is echoed on the
//! response, stored in a `tokio::task_local!` slot for the duration of the
//! request (so error bodies and audit rows can read it without threading it
//! through every signature), and attached to tracing spans.
//!
//! Background audit tasks are spawned outside the scope on purpose; they
//! capture the id by value before detaching.

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

/// Canonical header name.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    /// Task-local storage for the current request id.
    pub static REQUEST_ID: String;
}

/// Return the request id for the current task, or `None` outside a request.
#[must_use]
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// Run `future` with `id` installed as the task-local request id.
pub async fn with_request_id<F, T>(id: String, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_ID.scope(id, future).await
}

/// Accept-or-mint middleware: installs the id and echoes it on the response.
pub async fn middleware(request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);

    let mut response = with_request_id(id.clone(), next.run(request)).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
