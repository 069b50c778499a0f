pub mod config;
pub mod error;
pub mod messages;
pub mod model;

pub use config::*;
pub use error::*;
pub use messages::*;
pub use model::*;
