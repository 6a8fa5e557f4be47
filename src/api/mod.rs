//! HTTP surface: the thin handlers, routing and middleware the core
//! modules (cache, coalescer, executor, upload pipeline) are consumed
//! through. None of the request/response plumbing here participates in
//! the invariants those modules guarantee; it only translates between
//! HTTP and their Rust APIs.

pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
