pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod http;
pub mod manager;
pub mod resolver;
pub mod store;
pub mod sync;

pub use error::{ChatError, Result};
