pub mod crud;
pub mod error;
mod handlers;
pub mod helpers;
mod router;
pub mod types;

pub use router::{handle_request, is_public};
pub use types::{AppState, Principal, Request, Role};
