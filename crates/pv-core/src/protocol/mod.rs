//! Protocol module containing the header codec, command and status codes,
//! and the beacon datagram.

pub mod beacon;
pub mod codec;
pub mod messages;
pub mod sequence;
pub mod status;

pub use beacon::Beacon;
pub use codec::{decode_header, decode_message, encode_header, encode_message, ProtocolError};
pub use messages::*;
pub use sequence::SequenceCounter;
