//! rnotebook - R Markdown notebook kernel bridge.
//!
//! Runs R Markdown chunks against a persistent R process per document. The
//! kernel supervises the interpreter, talks to it over a loopback TCP socket
//! using Content-Length framed JSON, and correlates responses to requests by
//! id. The controller maps those responses onto cell run state and outputs.

use std::path::PathBuf;

pub mod connection;
pub mod controller;
pub mod kernel;
pub mod notebook;
pub mod protocol;
pub mod settings;
pub mod supervisor;
pub mod transport;

/// Cache directory for the installed bridge script.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("rnotebook")
}
