//! CASBS Server Library
//!
//! Content-addressable streaming blob store. Clients stream a blob in as a
//! size declaration followed by content chunks; identical content is stored
//! once and reference counted across every blob id that points at it.
//!
//! # Modules
//!
//! - `upload`: Upload session state machine and live-session tracking
//! - `content_store`: Digest-keyed content with reference counts
//! - `registry`: Blob id to digest mapping
//! - `service`: Upload/remove operations tying the above together
//! - `storage`: Byte media (local filesystem, memory, S3)
//! - `db`: Optional SQLite catalog for restart recovery
//! - `routes`: HTTP transport

pub mod config;
pub mod content_store;
pub mod db;
pub mod digest;
pub mod error;
pub mod registry;
pub mod routes;
pub mod service;
pub mod state;
pub mod storage;
pub mod upload;

use axum::Router;

use state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1/blobs", routes::blobs::router())
        .nest("/api/v1/uploads", routes::uploads::router())
        .nest("/api/v1/stats", routes::stats::router())
        .with_state(state)
}
