use nix::errno::Errno;
use strum_macros::{Display, IntoStaticStr};

/// Coarse result classes visible to a debugger front-end.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, IntoStaticStr)]
pub enum Status {
    #[strum(serialize = "transient")]
    TransientRetryable,
    #[strum(serialize = "not ready")]
    NotReady,
    #[strum(serialize = "not available")]
    NotAvailable,
    #[strum(serialize = "uninitialized")]
    Uninitialized,
    #[strum(serialize = "invalid argument")]
    InvalidArgument,
    #[strum(serialize = "unknown")]
    Unknown,
    #[strum(serialize = "device lost")]
    DeviceLost,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),

    // --------------------------------- session state errors --------------------------------------
    #[error("operation interrupted, retry")]
    TransientRetryable,
    #[error("no event or condition yet")]
    NotReady,
    #[error("resource not available")]
    NotAvailable,
    #[error("resource not initialized (or already destroyed)")]
    Uninitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{0}")]
    Unknown(String),
    #[error("device lost")]
    DeviceLost,

    // --------------------------------- syscall errors --------------------------------------------
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, Errno),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("malformed kernel event: {0}")]
    Decode(#[from] crate::debugger::event::DecodeError),
    #[error("invalid magic in {0}")]
    Magic(&'static str),
}

impl Error {
    /// Collapse an error into a coarse status class.
    pub fn status(&self) -> Status {
        match self {
            Error::TransientRetryable => Status::TransientRetryable,
            Error::NotReady => Status::NotReady,
            Error::NotAvailable => Status::NotAvailable,
            Error::Uninitialized => Status::Uninitialized,
            Error::InvalidArgument(_) => Status::InvalidArgument,
            Error::DeviceLost => Status::DeviceLost,
            Error::Syscall(_, Errno::EINTR | Errno::EAGAIN | Errno::EBUSY) => {
                Status::TransientRetryable
            }
            Error::IO(_)
            | Error::Config(_)
            | Error::Unknown(_)
            | Error::Syscall(_, _)
            | Error::Decode(_)
            | Error::Magic(_) => Status::Unknown,
        }
    }

    /// Return a hint to an interface - continue debugging after error or drop the session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Config(_) => false,
            Error::TransientRetryable => false,
            Error::NotReady => false,
            Error::NotAvailable => false,
            Error::Uninitialized => false,
            Error::InvalidArgument(_) => false,
            Error::Unknown(_) => false,
            Error::Syscall(_, _) => false,
            Error::Decode(_) => false,
            Error::Magic(_) => false,

            // currently fatal errors
            Error::DeviceLost => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "eudebug", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "eudebug", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(::log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(::log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::debug, $res, $msg)
    };
}

/// Report a broken caller contract and abort the process.
#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)+) => {{
        ::log::error!(target: "eudebug", $($arg)+);
        std::process::abort()
    }};
}
