use serde::{Deserialize, Serialize};

/// Error document carried in RPC rejections and WebSocket error responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("rpc error {code}: {reason}")]
pub struct RpcError {
    pub code: i32,
    pub reason: String,
}

impl RpcError {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(400, format!("Unknown method [{method}]"))
    }
}

/// Client-facing error codes used by the signal handlers.
///
/// The numeric values are part of the wire contract; clients key retry and
/// cleanup behavior off them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Uid = 1,
    Rid = 2,
    Mid = 3,
    Sid = 4,
    Jsep = 5,
    Sdp = 6,
    Minfo = 7,
    Pub = 8,
    Sub = 9,
    Sfu = 10,
    Register = 11,
    SfuRpc = 12,
    RegisterRpc = 13,
    Unknown = 14,
}

impl ErrorCode {
    pub fn reason(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Uid => "uid not found",
            ErrorCode::Rid => "rid not found",
            ErrorCode::Mid => "mid not found",
            ErrorCode::Sid => "sid not found",
            ErrorCode::Jsep => "jsep not found",
            ErrorCode::Sdp => "sdp not found",
            ErrorCode::Minfo => "minfo not found",
            ErrorCode::Pub => "pub not found",
            ErrorCode::Sub => "sub not found",
            ErrorCode::Sfu => "sfu not found",
            ErrorCode::Register => "register not found",
            ErrorCode::SfuRpc => "sfu rpc not found",
            ErrorCode::RegisterRpc => "register rpc not found",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

impl From<ErrorCode> for RpcError {
    fn from(code: ErrorCode) -> Self {
        RpcError::new(code as i32, code.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Jsep as i32, 5);
        assert_eq!(ErrorCode::Sfu as i32, 10);
        assert_eq!(ErrorCode::RegisterRpc as i32, 13);
        assert_eq!(ErrorCode::Unknown as i32, 14);
    }

    #[test]
    fn rpc_error_from_code() {
        let err: RpcError = ErrorCode::Rid.into();
        assert_eq!(err.code, 2);
        assert_eq!(err.reason, "rid not found");
    }

    #[test]
    fn rpc_error_serde_roundtrip() {
        let err = RpcError::new(403, "cannot get router");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""code":403"#));
        let parsed: RpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }
}
