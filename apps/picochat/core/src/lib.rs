//! Shared primitives for the picochat relay: the length-prefixed packet codec
//! and the text of the notifications the relay fans out.

pub mod notice;
pub mod packet;

pub use notice::{chat_notice, display_name, join_notice, leave_notice, strip_controls};
pub use packet::{decode, decode_frame, encode, DecodingError, EncodingError, Packet};

/// Number of leading characters of the handshake payload kept as a display name.
pub const MAX_NAME_LENGTH: usize = 8;

/// Number of body characters kept when decoding a packet.
pub const MAX_MSG_LENGTH: usize = 30;
