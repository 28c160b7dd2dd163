//! HTTP front end of bucketdeck

pub mod config;
pub mod handlers;
pub mod server;
pub mod thumbnail;

pub use config::*;
pub use handlers::{handle_request, ApiError, ResponseBody};
pub use server::*;
