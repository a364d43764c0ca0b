pub mod accounts;
pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod handshake;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod tls;
pub mod ws;

pub use coordinator::Coordinator;
pub use server::SignalingServer;
