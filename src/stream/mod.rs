//! Push-stream ingestion: hub lifecycle, health, reconnection.

pub mod health;
pub mod manager;

pub use health::{HealthMonitor, HealthStatus, PingStats};
pub use manager::{
    ConnectionState, GatewayEvent, ReconnectSchedule, StreamConnection, StreamManager,
    StreamSignal, StreamTransport, Subscription, WebSocketTransport,
};
