//! TinyPB frame format
//!
//! Layout (semua integer 32-bit big-endian):
//! ┌────────┬───────────┬────────────┬────────┬────────────┬─────────────┐
//! │ 0x02   │ total_len │ msg_id_len │ msg_id │ method_len │ method_name │
//! ├────────┴───┬───────┴────────────┴─┬──────┴───┬────────┴─┬───────────┤
//! │ err_code   │ err_info_len         │ err_info │ pb_data  │ checksum  │
//! ├────────────┴──────────────────────┴──────────┴──────────┴───────────┤
//! │ 0x03                                                                │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//! `total_len` mencakup seluruh record dari start marker sampai end marker.
//! Checksum dihitung dari start marker sampai byte terakhir `pb_data`.

use super::error_code::ErrorCode;

pub const PB_START: u8 = 0x02;
pub const PB_END: u8 = 0x03;

/// Ukuran record dengan semua field variabel kosong
pub const MIN_FRAME_LEN: usize = 1 + 4 + 4 + 4 + 4 + 4 + 4 + 1;

/// Batas default satu record (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame abstrak: apa pun yang punya message id untuk korelasi request/response
pub trait Protocol {
    fn msg_id(&self) -> &str;
    fn payload(&self) -> &[u8];
}

/// Frame TinyPB yang sudah di-decode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TinyPbFrame {
    pub msg_id: String,
    pub method_name: String,
    /// 0 = sukses, selain itu lihat `ErrorCode`
    pub err_code: i32,
    pub err_info: String,
    /// Payload hasil serialisasi (opaque bagi transport)
    pub pb_data: Vec<u8>,
}

impl TinyPbFrame {
    pub fn new(
        msg_id: impl Into<String>,
        method_name: impl Into<String>,
        pb_data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            msg_id: msg_id.into(),
            method_name: method_name.into(),
            err_code: 0,
            err_info: String::new(),
            pb_data: pb_data.into(),
        }
    }

    /// Frame yang membawa error, tanpa payload
    pub fn error(msg_id: impl Into<String>, code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            method_name: String::new(),
            err_code: code.as_i32(),
            err_info: info.into(),
            pb_data: Vec::new(),
        }
    }

    /// Tandai frame ini gagal, payload dibuang
    pub fn set_error(&mut self, code: ErrorCode, info: impl Into<String>) {
        self.err_code = code.as_i32();
        self.err_info = info.into();
        self.pb_data.clear();
    }

    #[inline(always)]
    pub fn is_ok(&self) -> bool {
        self.err_code == 0
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.err_code)
    }

    /// Panjang record di wire
    #[inline]
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN
            + self.msg_id.len()
            + self.method_name.len()
            + self.err_info.len()
            + self.pb_data.len()
    }
}

impl Protocol for TinyPbFrame {
    fn msg_id(&self) -> &str {
        &self.msg_id
    }

    fn payload(&self) -> &[u8] {
        &self.pb_data
    }
}

/// Checksum 32-bit (Adler variant, cepat)
#[inline(always)]
pub fn checksum32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for &byte in data {
        a = a.wrapping_add(byte as u32);
        b = b.wrapping_add(a);
    }

    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_frame_len() {
        assert_eq!(MIN_FRAME_LEN, 26);
        assert_eq!(TinyPbFrame::default().encoded_len(), MIN_FRAME_LEN);
    }

    #[test]
    fn test_encoded_len_counts_every_field() {
        let frame = TinyPbFrame {
            msg_id: "42".into(),
            method_name: "Echo.ping".into(),
            err_code: 0,
            err_info: "ok".into(),
            pb_data: b"ping".to_vec(),
        };
        assert_eq!(frame.encoded_len(), 26 + 2 + 9 + 2 + 4);
    }

    #[test]
    fn test_error_frame() {
        let frame = TinyPbFrame::error("7", ErrorCode::RpcCallTimeout, "deadline exceeded");
        assert!(!frame.is_ok());
        assert_eq!(frame.error_code(), Some(ErrorCode::RpcCallTimeout));
        assert_eq!(frame.msg_id(), "7");
    }

    #[test]
    fn test_checksum_detects_single_byte_flip() {
        let a = checksum32(b"hello tinypb");
        let b = checksum32(b"hello tinyPb");
        assert_ne!(a, b);
        assert_eq!(checksum32(b""), 1);
    }
}
