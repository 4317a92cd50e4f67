//! Kode error yang dibawa di field `err_code` frame TinyPB
//!
//! Semua kode memakai prefix `1000xxxx`; peer TinyPB lain membaca nilai yang sama.

use std::fmt;

/// Kode error pada wire. `0` (bukan variant) berarti sukses.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Koneksi ditutup peer (termasuk connection refused saat connect)
    PeerClosed = 10000000,
    /// Connect gagal
    FailedConnect = 10000001,
    /// Gagal mendapatkan reply
    FailedGetReply = 10000002,
    FailedDeserialize = 10000003,
    FailedSerialize = 10000004,
    FailedEncode = 10000005,
    FailedDecode = 10000006,
    /// RPC call melewati deadline
    RpcCallTimeout = 10000007,
    ServiceNotFound = 10000008,
    MethodNotFound = 10000009,
    ParseServiceName = 10000010,
    RpcChannelInit = 10000011,
    RpcPeerAddr = 10000012,
}

impl ErrorCode {
    #[inline(always)]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            10000000 => Some(Self::PeerClosed),
            10000001 => Some(Self::FailedConnect),
            10000002 => Some(Self::FailedGetReply),
            10000003 => Some(Self::FailedDeserialize),
            10000004 => Some(Self::FailedSerialize),
            10000005 => Some(Self::FailedEncode),
            10000006 => Some(Self::FailedDecode),
            10000007 => Some(Self::RpcCallTimeout),
            10000008 => Some(Self::ServiceNotFound),
            10000009 => Some(Self::MethodNotFound),
            10000010 => Some(Self::ParseServiceName),
            10000011 => Some(Self::RpcChannelInit),
            10000012 => Some(Self::RpcPeerAddr),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::PeerClosed => "connection closed by peer",
            Self::FailedConnect => "connect failed",
            Self::FailedGetReply => "failed to get reply",
            Self::FailedDeserialize => "deserialize failed",
            Self::FailedSerialize => "serialize failed",
            Self::FailedEncode => "encode failed",
            Self::FailedDecode => "decode failed",
            Self::RpcCallTimeout => "rpc call timeout",
            Self::ServiceNotFound => "service not found",
            Self::MethodNotFound => "method not found",
            Self::ParseServiceName => "parse service name failed",
            Self::RpcChannelInit => "rpc channel init failed",
            Self::RpcPeerAddr => "peer address exception",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_i32(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_prefix() {
        assert_eq!(ErrorCode::PeerClosed.as_i32(), 10000000);
        assert_eq!(ErrorCode::ParseServiceName.as_i32(), 10000010);
        assert_eq!(ErrorCode::RpcPeerAddr.as_i32(), 10000012);
    }

    #[test]
    fn test_from_i32() {
        for v in 10000000..=10000012 {
            let code = ErrorCode::from_i32(v).unwrap();
            assert_eq!(code.as_i32(), v);
        }
        assert_eq!(ErrorCode::from_i32(0), None);
        assert_eq!(ErrorCode::from_i32(10000013), None);
    }
}
