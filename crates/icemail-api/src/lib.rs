//! icemail API - HTTP query API
//!
//! This crate exposes search, listing, lookup by id and delivery activation
//! of archived messages over HTTP.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
