//! `gate-server` is the session daemon for the KV sync gateway: it accepts
//! framed client connections (`wire`), authenticates and polices the
//! target topic (`topics`), and drives `gate_core::sync::run_sync` for
//! each one (`server::session`). `cli`/`config` resolve the daemon's
//! runtime settings and `trace` sets up logging.

pub mod cli;
pub mod config;
pub mod server;
pub mod tls;
pub mod topics;
pub mod trace;
pub mod wire;
