//! Database models split into domain-specific modules.

pub mod app;
pub mod session;

pub use app::*;
pub use session::*;
