//! Dashboard: HTTP + SSE server, the stdout marker protocol, and config
//! import/export.

pub mod config_api;
pub mod content;
pub mod events;
pub mod server;
pub mod sse;

pub use events::{DashboardEmitter, DashboardEvent, EVENT_PREFIX};
pub use server::{AppState, build_router, find_available_port, serve};
pub use sse::{SseBroadcaster, SseMessage};
