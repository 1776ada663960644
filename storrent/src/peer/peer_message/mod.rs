pub mod bitfield;
pub mod message;

pub use bitfield::{Bitfield, BitfieldError};
pub use message::{Message, MessageError, MessageId};
