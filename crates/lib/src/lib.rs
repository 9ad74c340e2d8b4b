//! Skiff core library — Open-WebUI backend client, stream reconciliation,
//! streaming registry, and lifecycle/connectivity coordination
//! used by the CLI and the platform shells.

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod retry;
pub mod stream;
