use thiserror::Error;

/// Failure taxonomy for the distributed execution kernel.
///
/// Every cross-component failure is one of these kinds; layers either
/// recover according to [`Recovery`] or attach a message to the query's
/// message log and rethrow to their owner. Only the query dispatcher
/// converts an error into a terminal query status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("worker rejected bundle: {reason}")]
    WorkerRejectedBundle { retryable: bool, reason: String },

    #[error("worker execution error {errno}: {message}")]
    WorkerExecution { errno: i32, message: String },

    #[error("merge write error: {0}")]
    MergeWrite(String),

    #[error("result too big: {0}")]
    ResultTooBig(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How a failure kind may be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Jobs may be released and reassigned within the attempt budget.
    Retryable,
    /// The owning query must fail.
    NonRetryable,
    /// The query fails with a user-visible error; retrying cannot help.
    UserError,
}

impl CoreError {
    pub fn recovery(&self) -> Recovery {
        match self {
            CoreError::Transport(_) | CoreError::Timeout(_) | CoreError::MergeWrite(_) => {
                Recovery::Retryable
            }
            CoreError::WorkerRejectedBundle { retryable, .. } => {
                if *retryable {
                    Recovery::Retryable
                } else {
                    Recovery::NonRetryable
                }
            }
            CoreError::ResultTooBig(_) => Recovery::UserError,
            CoreError::WorkerExecution { .. }
            | CoreError::Cancelled(_)
            | CoreError::Config(_)
            | CoreError::InvalidProtocol(_)
            | CoreError::Auth(_)
            | CoreError::Internal(_) => Recovery::NonRetryable,
        }
    }

    /// Numeric code carried in `errorCode` fields on the wire.
    pub fn wire_code(&self) -> i32 {
        match self {
            CoreError::Transport(_) => 1,
            CoreError::WorkerRejectedBundle { .. } => 2,
            CoreError::WorkerExecution { .. } => 3,
            CoreError::MergeWrite(_) => 4,
            CoreError::ResultTooBig(_) => 5,
            CoreError::Cancelled(_) => 6,
            CoreError::Timeout(_) => 7,
            CoreError::Config(_) => 8,
            CoreError::InvalidProtocol(_) => 9,
            CoreError::Auth(_) => 10,
            CoreError::Internal(_) => 11,
        }
    }

    /// Rebuild an error from a wire `(errorCode, errorMsg)` pair.
    pub fn from_wire(code: i32, msg: String) -> Self {
        match code {
            1 => CoreError::Transport(msg),
            2 => CoreError::WorkerRejectedBundle {
                retryable: false,
                reason: msg,
            },
            3 => CoreError::WorkerExecution {
                errno: 0,
                message: msg,
            },
            4 => CoreError::MergeWrite(msg),
            5 => CoreError::ResultTooBig(msg),
            6 => CoreError::Cancelled(msg),
            7 => CoreError::Timeout(msg),
            8 => CoreError::Config(msg),
            9 => CoreError::InvalidProtocol(msg),
            10 => CoreError::Auth(msg),
            _ => CoreError::Internal(msg),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::InvalidProtocol(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CoreError::Timeout(e.to_string())
        } else {
            CoreError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_recovery_table() {
        assert_eq!(
            CoreError::Transport("x".into()).recovery(),
            Recovery::Retryable
        );
        assert_eq!(
            CoreError::WorkerRejectedBundle {
                retryable: true,
                reason: "busy".into()
            }
            .recovery(),
            Recovery::Retryable
        );
        assert_eq!(
            CoreError::WorkerRejectedBundle {
                retryable: false,
                reason: "bad version".into()
            }
            .recovery(),
            Recovery::NonRetryable
        );
        assert_eq!(
            CoreError::WorkerExecution {
                errno: 1064,
                message: "syntax".into()
            }
            .recovery(),
            Recovery::NonRetryable
        );
        assert_eq!(
            CoreError::ResultTooBig("1G".into()).recovery(),
            Recovery::UserError
        );
        assert_eq!(CoreError::Auth("key".into()).recovery(), Recovery::NonRetryable);
    }

    #[test]
    fn wire_codes_round_trip_kind() {
        let errs = vec![
            CoreError::Transport("a".into()),
            CoreError::MergeWrite("b".into()),
            CoreError::ResultTooBig("c".into()),
            CoreError::Timeout("d".into()),
            CoreError::Auth("e".into()),
        ];
        for e in errs {
            let back = CoreError::from_wire(e.wire_code(), "m".into());
            assert_eq!(back.wire_code(), e.wire_code());
        }
    }
}
