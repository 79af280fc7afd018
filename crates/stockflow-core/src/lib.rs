pub mod config;
pub mod context;
pub mod error;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::{RunContext, SharedContext};
pub use error::{Result, StockflowError};
pub use types::*;
