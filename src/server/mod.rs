pub mod handlers;
pub mod state;
pub mod ws;

pub use handlers::create_router;
pub use state::{AppState, ConnectionInfo};
