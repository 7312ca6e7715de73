//! Wire protocol shared by the coordinator and every client process
//!
//! Simple JSON-over-newline protocol. Each record is a single line of JSON
//! followed by `\n`. The first record on a connection is a [`Handshake`];
//! the coordinator answers with a [`HandshakeAck`] and a reset directive.

pub mod codec;
pub mod messages;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameDecoder, FramedReader, decode_segment, encode_frame, write_frame};
pub use messages::{
    AtcAction, DirectiveAction, Extra, Handshake, HandshakeAck, Message, OperatorAction, Role, unix_timestamp,
};
