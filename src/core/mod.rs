pub mod envelope;
pub mod error;
pub mod stop;

pub use envelope::{now_ms, Envelope, ReplyType, DEFAULT_COMP_TYPE};
pub use error::{BusError, Result};
pub use stop::StopToken;
