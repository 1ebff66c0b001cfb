mod classify;
mod handler;
mod redact;
mod streaming;

pub use handler::{cors_preflight_response, proxy_handler};
