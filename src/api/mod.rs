//! Spinwheel HTTP / WebSocket API
//!
//! Thin transport over the engine handle: every wager goes through the engine
//! task, reads of settled history go straight to the round store.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use routes::create_router;
pub use server::ApiServer;
