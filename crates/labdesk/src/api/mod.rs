//! HTTP control surface.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::{create_app, create_router};
pub use state::AppState;
