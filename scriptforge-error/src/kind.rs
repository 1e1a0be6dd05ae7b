//! What went wrong, as a closed set of categories.

use std::fmt;

macro_rules! error_kinds {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Category of an [`Error`](crate::Error). The CLI and pipeline only
        /// branch on a few of these; the rest are for logs and tests.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ErrorKind {
            $($(#[$doc])* $name,)*
        }

        impl ErrorKind {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ErrorKind::$name => stringify!($name),)*
                }
            }
        }
    };
}

error_kinds! {
    Unexpected,
    Unsupported,
    /// An environment variable or flag has an unusable value
    ConfigInvalid,
    InvalidArgument,

    /// The model call failed or returned nothing usable
    InferenceFailed,
    /// No key, or the endpoint cannot be reached
    ProviderUnavailable,
    RateLimited,
    AuthenticationFailed,

    /// The generator tool reported an error
    ToolFailed,
    /// Malformed JSON-RPC traffic from the tool server
    ProtocolFailed,
    /// A pipe, socket or stdin closed under us
    ChannelClosed,

    /// The generator produced no `=== file ===` sections
    BundleEmpty,
    ParseFailed,
    /// No `run_*.py` to execute
    ScriptNotFound,
    ScriptFailed,
    ScriptTimeout,
    /// `qsub` refused the job
    JobSubmitFailed,
    /// The reviewer answered `stop`
    StoppedByUser,

    FileNotFound,
    PermissionDenied,
    IoFailed,
    NetworkFailed,
    SerializationFailed,
}

impl ErrorKind {
    /// Kinds whose errors start out as temporary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::InferenceFailed
                | ErrorKind::ProviderUnavailable
                | ErrorKind::RateLimited
                | ErrorKind::NetworkFailed
                | ErrorKind::ScriptTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
