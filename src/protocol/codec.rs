//! Codec: frame <-> TcpBuffer
//!
//! Encode langsung ke ruang writable buffer (tanpa alokasi perantara).
//! Decode tidak pernah blocking: ambil semua record lengkap yang ada,
//! sisakan byte parsial untuk read berikutnya.

use thiserror::Error;
use tracing::warn;

use super::error_code::ErrorCode;
use super::frame::{
    checksum32, Protocol, TinyPbFrame, DEFAULT_MAX_FRAME_LEN, MIN_FRAME_LEN, PB_END, PB_START,
};
use crate::core::TcpBuffer;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialize failed: {0}")]
    Serialize(String),
    #[error("deserialize failed: {0}")]
    Deserialize(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

impl CodecError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CodecError::Serialize(_) => ErrorCode::FailedSerialize,
            CodecError::Deserialize(_) => ErrorCode::FailedDeserialize,
            CodecError::Encode(_) | CodecError::FrameTooLarge { .. } => ErrorCode::FailedEncode,
            CodecError::Decode(_) => ErrorCode::FailedDecode,
        }
    }
}

/// Seam antara connection dan format wire
pub trait Codec {
    type Frame: Protocol;

    /// Encode satu frame ke `out`. Returns jumlah byte yang ditulis.
    fn encode_frame(&self, frame: &Self::Frame, out: &mut TcpBuffer) -> Result<usize, CodecError>;

    /// Encode semua frame, berhenti di frame pertama yang gagal
    fn encode(&self, frames: &[Self::Frame], out: &mut TcpBuffer) -> Result<usize, CodecError> {
        let mut written = 0;
        for frame in frames {
            written += self.encode_frame(frame, out)?;
        }
        Ok(written)
    }

    /// Decode semua record lengkap di `buffer`, read cursor maju melewatinya
    fn decode(&self, buffer: &mut TcpBuffer) -> Vec<Self::Frame>;
}

/// Codec untuk length-prefixed TinyPB record
#[derive(Debug, Clone, Copy)]
pub struct TinyPbCodec {
    max_frame_len: usize,
}

impl Default for TinyPbCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl TinyPbCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.clamp(MIN_FRAME_LEN, u32::MAX as usize),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Offset start marker berikutnya (setelah posisi 0) yang membawa record
    /// lengkap dan valid di dalam `data`
    fn find_complete_record(&self, data: &[u8]) -> Option<usize> {
        let mut from = 1;
        while let Some(offset) = data[from..].iter().position(|&b| b == PB_START) {
            let start = from + offset;
            from = start + 1;

            let rest = &data[start..];
            if rest.len() < MIN_FRAME_LEN {
                return None;
            }
            let total = read_u32(&rest[1..5]) as usize;
            if !(MIN_FRAME_LEN..=self.max_frame_len).contains(&total) || total > rest.len() {
                continue;
            }
            if self.parse_record(&rest[..total]).is_ok() {
                return Some(start);
            }
        }
        None
    }

    /// Parse satu record utuh (start marker sampai end marker)
    fn parse_record(&self, record: &[u8]) -> Result<TinyPbFrame, CodecError> {
        let len = record.len();
        if record[len - 1] != PB_END {
            return Err(CodecError::Decode("missing end marker".into()));
        }

        let body_end = len - 5;
        let stored = read_u32(&record[body_end..body_end + 4]);
        let computed = checksum32(&record[..body_end]);
        if stored != computed {
            return Err(CodecError::Decode(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let mut reader = Reader {
            data: &record[..body_end],
            pos: 5,
        };
        let msg_id = reader.string("msg_id")?;
        let method_name = reader.string("method_name")?;
        let err_code = reader.u32()? as i32;
        let err_info = reader.string("err_info")?;
        let pb_data = reader.rest().to_vec();

        Ok(TinyPbFrame {
            msg_id,
            method_name,
            err_code,
            err_info,
            pb_data,
        })
    }
}

impl Codec for TinyPbCodec {
    type Frame = TinyPbFrame;

    fn encode_frame(&self, frame: &TinyPbFrame, out: &mut TcpBuffer) -> Result<usize, CodecError> {
        let total = frame.encoded_len();
        if total > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: total,
                max: self.max_frame_len,
            });
        }

        out.ensure_writable(total);
        let dst = &mut out.writable_slice_mut()[..total];
        let mut pos = 0;

        put(dst, &mut pos, &[PB_START]);
        put(dst, &mut pos, &(total as u32).to_be_bytes());
        put(dst, &mut pos, &(frame.msg_id.len() as u32).to_be_bytes());
        put(dst, &mut pos, frame.msg_id.as_bytes());
        put(dst, &mut pos, &(frame.method_name.len() as u32).to_be_bytes());
        put(dst, &mut pos, frame.method_name.as_bytes());
        put(dst, &mut pos, &frame.err_code.to_be_bytes());
        put(dst, &mut pos, &(frame.err_info.len() as u32).to_be_bytes());
        put(dst, &mut pos, frame.err_info.as_bytes());
        put(dst, &mut pos, &frame.pb_data);

        let checksum = checksum32(&dst[..pos]);
        put(dst, &mut pos, &checksum.to_be_bytes());
        put(dst, &mut pos, &[PB_END]);
        debug_assert_eq!(pos, total);

        out.advance_write(total);
        Ok(total)
    }

    fn decode(&self, buffer: &mut TcpBuffer) -> Vec<TinyPbFrame> {
        let mut frames = Vec::new();

        loop {
            let data = buffer.readable_slice();

            // Resync: buang semua byte sebelum start marker
            let Some(start) = data.iter().position(|&b| b == PB_START) else {
                let garbage = data.len();
                if garbage > 0 {
                    warn!(garbage, "no start marker in buffer, discarding");
                    buffer.advance_read(garbage);
                }
                break;
            };
            if start > 0 {
                warn!(garbage = start, "discarding bytes before start marker");
                buffer.advance_read(start);
                continue;
            }

            if data.len() < MIN_FRAME_LEN {
                break;
            }

            let total = read_u32(&data[1..5]) as usize;
            if !(MIN_FRAME_LEN..=self.max_frame_len).contains(&total) {
                warn!(total, "implausible frame length, rescanning");
                buffer.advance_read(1);
                continue;
            }
            if data.len() < total {
                // Mungkin marker palsu: kalau ada record utuh setelahnya, lompat ke sana
                match self.find_complete_record(data) {
                    Some(skip) => {
                        warn!(garbage = skip, declared = total, "skipping stalled start marker");
                        buffer.advance_read(skip);
                        continue;
                    }
                    // Record belum lengkap, tunggu read berikutnya
                    None => break,
                }
            }

            match self.parse_record(&data[..total]) {
                Ok(frame) => {
                    frames.push(frame);
                    buffer.advance_read(total);
                }
                Err(e) => {
                    warn!(error = %e, "dropping corrupt record");
                    buffer.advance_read(1);
                }
            }
        }

        frames
    }
}

#[inline(always)]
fn put(dst: &mut [u8], pos: &mut usize, bytes: &[u8]) {
    dst[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
}

#[inline(always)]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Cursor bounds-checked di atas body record
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CodecError::Decode(format!("{field} overruns record")))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.take(4, "integer field").map(read_u32)
    }

    fn string(&mut self, field: &str) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Deserialize(format!("{field} is not valid utf-8")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }
}
