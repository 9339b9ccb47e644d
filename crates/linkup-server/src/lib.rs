pub mod bridge;
pub mod chat;
pub mod connection;
pub mod dashboard;
pub mod events;
pub mod presence;
pub mod router;
pub mod server;

pub use bridge::StreamingBridge;
pub use dashboard::DashboardBroadcast;
pub use presence::PresenceRegistry;
pub use server::{start, ServerConfig, ServerHandle};
