//! HTTP handlers for the inbox (socket-equivalent writes), presence,
//! keypackage, and session management endpoints.

pub mod inbox;
pub mod keypackages;
pub mod presence;
pub mod session;

pub use inbox::inbox;
pub use keypackages::{fetch_keypackages, publish_keypackages, rotate_keypackages};
pub use presence::{lease, renew, unwatch, watch};
pub use session::{list_sessions, logout_all, resume as session_resume, revoke, start as session_start};
