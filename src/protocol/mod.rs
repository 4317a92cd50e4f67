//! Protocol Layer: TinyPB binary framing
//!
//! Prinsip desain:
//! - Length-prefixed: record bisa dirakit ulang dari partial read
//! - Self-synchronizing: garbage dan record korup dibuang, bukan fatal
//! - Encode langsung ke buffer tujuan

mod codec;
mod error_code;
mod frame;

pub use codec::{Codec, CodecError, TinyPbCodec};
pub use error_code::ErrorCode;
pub use frame::{
    checksum32, Protocol, TinyPbFrame, DEFAULT_MAX_FRAME_LEN, MIN_FRAME_LEN, PB_END, PB_START,
};
