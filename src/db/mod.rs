//! Result store for Dinghy Ping.
//!
//! Provides SQLite key/value storage of the latest outcome per probed target.

mod history;
mod models;
mod store;

pub use history::*;
pub use models::*;
pub use store::*;
