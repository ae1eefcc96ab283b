//! Server-side relay components
//!
//! The relay is split into the in-memory core (session table, connection
//! registry, room index, event router) and the QUIC transport that feeds it.

pub mod connection;
pub mod registry;
pub mod relay_server;
pub mod rooms;
pub mod router;
pub mod session;

pub use connection::ConnectionHandler;
pub use registry::ConnectionRegistry;
pub use relay_server::{RelayServer, RelayStats};
pub use rooms::RoomIndex;
pub use router::{InboundEvent, RelayCore};
pub use session::{SessionHandle, SessionTable};
