pub mod config;
pub mod credentials;
pub mod error;
pub mod types;

pub use config::Config;
pub use credentials::*;
pub use error::{FeedError, Result};
pub use types::*;
