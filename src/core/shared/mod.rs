pub mod enums;
pub mod error;
pub mod schema;
pub mod state;
pub mod utils;

pub use enums::*;
pub use error::{ApiError, Classify, ErrorKind};
pub use state::{AppState, SharedState};
pub use utils::DbPool;
