//! Discovery wire protocol: message types and the text codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_hello, encode_hello, is_announce, ProtocolError};
pub use messages::{HelloMessage, ANNOUNCE, HELLO_PREFIX};
