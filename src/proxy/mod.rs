//! HTTP gateway module.
//!
//! Accepts generation requests, forwards them upstream and re-emits one
//! uniform SSE protocol to the client while tracking usage.

mod handlers;
pub mod heartbeat;
pub mod normalize;
mod server;
pub mod session;
pub mod sse;
pub mod stream;
pub mod transport;
pub mod types;

pub use handlers::{ACCOUNT_TYPE_HEADER, CALLER_ID_HEADER};
pub use heartbeat::{HeartbeatMultiplexer, HeartbeatState};
pub use normalize::{normalize, ErrorBody, ErrorEnvelope, ErrorKind};
pub use server::{create_router, run_server, AppState};
pub use session::{StreamSession, Termination};
pub use stream::{UsageSummary, UsageTracker};
pub use transport::{TransportError, UpstreamClient, UpstreamRequest};
pub use types::{StreamRouting, UpstreamShape};
