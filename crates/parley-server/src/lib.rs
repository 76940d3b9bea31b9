pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;

pub use registry::ConnectionRegistry;
pub use rooms::RoomTable;
pub use router::MessageRouter;
pub use server::{start, ServerConfig, ServerHandle};
