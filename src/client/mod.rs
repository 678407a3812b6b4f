//! Client side of the chat: views that keep local state in step with the
//! relay, over either an in-process or an HTTP backend.

pub mod backend;
pub mod badge;
pub mod http;
pub mod subscription;
pub mod thread;

pub use backend::{ChatBackend, LocalBackend};
pub use badge::UnreadBadge;
pub use http::HttpBackend;
pub use subscription::Subscription;
pub use thread::ThreadView;
