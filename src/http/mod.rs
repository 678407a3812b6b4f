pub mod server;
pub mod session;

pub use server::{router, AppState};
pub use session::{SessionUser, SESSION_HEADER};
