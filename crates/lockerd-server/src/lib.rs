//! `lockerd` gateway library.
//!
//! HTTP/JSON control plane for RFID locker kiosks: routes, error mapping,
//! application wiring, and server configuration. The binary entry point in
//! `main.rs` adds process concerns (logging, background workers, graceful
//! shutdown).

pub mod app;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
