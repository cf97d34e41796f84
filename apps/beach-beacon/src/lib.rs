pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
mod websocket;
