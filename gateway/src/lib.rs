// Trellis gateway: HTTP command/query surface and the WebSocket push channel.

pub mod handlers;
pub mod server;
pub mod ws;

pub use server::Gateway;
