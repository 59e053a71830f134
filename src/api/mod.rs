pub mod server;
pub mod types;

pub use types::{ApiError, ApiServer, AppState, DeviceFactory};
