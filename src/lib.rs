// netwatcher: passive per-host network traffic recorder.
//
// Pipeline: capture (AF_PACKET) -> packet decode -> session tracking ->
// batched persistence (SQLite), with an offline compactor that merges event
// pairs and rolls old rows into hourly summaries.

pub mod capture;
pub mod cli;
pub mod dns;
pub mod error;
pub mod packet;
pub mod privilege;
pub mod publisher;
pub mod session;
pub mod store;
pub mod system;
pub mod tls;
#[cfg(target_os = "linux")]
pub mod watcher;
