//! Status codes shared by every protocol.

use std::fmt;
use std::str::FromStr;

use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RPC status codes.
///
/// The sixteen error codes are fixed across Connect, gRPC and gRPC-Web.
/// Values outside the known range are carried as [`Code::Other`] so that they
/// survive a text round-trip (`code_<n>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    /// A numeric code outside `0..=16`.
    Other(u32),
}

impl Code {
    /// Every named code, in numeric order.
    pub const ALL: [Code; 17] = [
        Code::Ok,
        Code::Canceled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Build a code from its numeric value.
    pub fn from_u32(value: u32) -> Code {
        match Code::ALL.get(value as usize) {
            Some(code) => *code,
            None => Code::Other(value),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::Canceled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
            Code::Other(value) => *value,
        }
    }

    /// Canonical snake_case name, `None` for [`Code::Other`].
    pub fn as_str(&self) -> Option<&'static str> {
        let name = match self {
            Code::Ok => "ok",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
            Code::Other(_) => return None,
        };
        Some(name)
    }

    /// HTTP status used by Connect unary error responses.
    pub fn to_http_status(&self) -> StatusCode {
        let status = match self {
            Code::Canceled => 499,
            Code::Unknown => 500,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 504,
            Code::NotFound => 404,
            Code::AlreadyExists => 409,
            Code::PermissionDenied => 403,
            Code::ResourceExhausted => 429,
            Code::FailedPrecondition => 400,
            Code::Aborted => 409,
            Code::OutOfRange => 400,
            Code::Unimplemented => 501,
            Code::Internal => 500,
            Code::Unavailable => 503,
            Code::DataLoss => 500,
            Code::Unauthenticated => 401,
            Code::Ok | Code::Other(_) => 500,
        };
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Best-effort code for an HTTP status when the peer sent nothing richer.
    pub fn from_http_status(status: StatusCode) -> Code {
        match status.as_u16() {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(name) => f.write_str(name),
            None => write!(f, "code_{}", self.as_u32()),
        }
    }
}

/// Error returned when parsing a [`Code`] from text fails.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid code {0:?}")]
pub struct ParseCodeError(String);

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(code) = Code::ALL.iter().find(|code| code.as_str() == Some(s)) {
            return Ok(*code);
        }
        // Only out-of-range values use the numeric form.
        if let Some(value) = s.strip_prefix("code_").and_then(|n| n.parse::<u32>().ok()) {
            if let Code::Other(value) = Code::from_u32(value) {
                return Ok(Code::Other(value));
            }
        }
        Err(ParseCodeError(s.to_string()))
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_text_round_trip() {
        for code in Code::ALL {
            let text = code.to_string();
            assert_eq!(text.parse::<Code>(), Ok(code), "{text}");
        }
    }

    #[test]
    fn test_code_out_of_range() {
        assert_eq!("code_999".parse::<Code>(), Ok(Code::Other(999)));
        assert_eq!(Code::Other(999).to_string(), "code_999");
        assert_eq!(Code::from_u32(999), Code::Other(999));
        assert_eq!(Code::from_u32(14), Code::Unavailable);
    }

    #[test]
    fn test_code_rejects_unknown_text() {
        assert!("bogus".parse::<Code>().is_err());
        assert!("cancelled".parse::<Code>().is_err());
        assert!("code_3".parse::<Code>().is_err());
        assert!("code_".parse::<Code>().is_err());
        assert!("".parse::<Code>().is_err());
    }

    #[test]
    fn test_code_serde() {
        let json = serde_json::to_string(&Code::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
        let code: Code = serde_json::from_str("\"code_42\"").unwrap();
        assert_eq!(code, Code::Other(42));
        assert!(serde_json::from_str::<Code>("\"nope\"").is_err());
    }

    #[test]
    fn test_code_to_http_status() {
        assert_eq!(Code::Canceled.to_http_status().as_u16(), 499);
        assert_eq!(Code::ResourceExhausted.to_http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Code::Unimplemented.to_http_status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(Code::Unauthenticated.to_http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Code::Other(77).to_http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_code_from_http_status() {
        assert_eq!(Code::from_http_status(StatusCode::BAD_REQUEST), Code::Internal);
        assert_eq!(Code::from_http_status(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(Code::from_http_status(StatusCode::TOO_MANY_REQUESTS), Code::Unavailable);
        assert_eq!(Code::from_http_status(StatusCode::BAD_GATEWAY), Code::Unavailable);
        assert_eq!(Code::from_http_status(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }
}
