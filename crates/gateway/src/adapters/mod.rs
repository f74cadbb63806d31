//! Frontend adapters — non-WebSocket channels translated to canonical
//! requests and events at the edge.

pub mod telegram;

pub use telegram::spawn_telegram_adapter;
