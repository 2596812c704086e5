mod error;
mod handlers;
mod pump;
mod router;
mod types;

pub use pump::pump;
pub use router::handle_request;
pub use types::{AppState, Request};
