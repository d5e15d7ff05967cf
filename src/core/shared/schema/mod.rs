pub mod access;
pub mod billing;
pub mod entities;

pub use self::access::*;
pub use self::billing::*;
pub use self::entities::*;
