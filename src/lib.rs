// FazAI - local command daemon
// Library exports

pub mod client;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod inference;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod monitoring;
pub mod pipeline;
pub mod protocol;
pub mod providers;
pub mod server;
pub mod session;
pub mod shell;
