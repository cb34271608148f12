use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    DeadlineExceeded,
    Cancelled,
    InvalidArgument,
    SerializeFailed,
    DeserializeFailed,
    ProtocolError,
    TcpConnectFailed,
    TcpBindFailed,
    TcpSendMsgFailed,
    TcpRecvMsgFailed,
    ConnectionClosed,
    HandlerError,
    UnregisteredService,
    UnknownMethod,
    DuplicateService,
    NoServerAvailable,
    HttpRequestFailed,
    #[serde(untagged)]
    Unknown(String),
}

impl ErrorKind {
    /// Errors that break the connection they happened on.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ErrorKind::TcpSendMsgFailed | ErrorKind::TcpRecvMsgFailed | ErrorKind::ConnectionClosed
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }

    /// Rebuilds an error from the string a peer put into a response header.
    ///
    /// Strings produced by this type's `Display` keep their kind, anything
    /// else is reported as a [`ErrorKind::HandlerError`].
    #[must_use]
    pub fn from_remote(s: &str) -> Self {
        let (kind, msg) = s.split_once(": ").unwrap_or((s, ""));
        match serde_json::from_value::<ErrorKind>(serde_json::Value::String(kind.to_string())) {
            Ok(ErrorKind::Unknown(_)) | Err(_) => Self::new(ErrorKind::HandlerError, s.to_string()),
            Ok(kind) => Self::new(kind, msg.to_string()),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(value: std::num::TryFromIntError) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            msg: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(value: rmp_serde::encode::Error) -> Self {
        Self {
            kind: ErrorKind::SerializeFailed,
            msg: value.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(value: rmp_serde::decode::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
