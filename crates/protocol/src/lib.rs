pub mod config;
pub mod error;
pub mod keys;
pub mod messages;

pub use config::*;
pub use error::*;
pub use keys::*;
pub use messages::*;
