mod admin;
mod error_handler;
mod rate_limit;

pub use admin::{ADMIN_TOKEN_HEADER, AdminToken, require_admin};
pub use error_handler::log_errors;
pub use rate_limit::{API_KEY_HEADER, Admission, rate_limit};
