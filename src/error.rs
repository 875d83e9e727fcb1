use std::process::ExitStatus;

use snafu::{
    AsBacktrace, AsErrorSource, Backtrace, Error, ErrorCompat, GenerateImplicitData, IntoError,
    NoneError, Snafu,
};

#[derive(Snafu, Debug)]
#[snafu(crate_root(crate::error))]
#[allow(clippy::enum_variant_names)]
pub enum ControllerError {
    #[snafu(display("Kube Error: {source}"))]
    KubeError {
        #[snafu(source)]
        source: kube::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Watcher Error: {source}"))]
    WatcherError {
        #[snafu(source)]
        source: kube::runtime::watcher::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Reflector writer dropped: {source}"))]
    WriterDroppedError {
        #[snafu(source)]
        source: kube::runtime::reflector::store::WriterDropped,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("Cache sync timed out: {source}"))]
    CacheSyncTimeout {
        #[snafu(source)]
        source: tokio::time::error::Elapsed,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("I/O Error: {source}"))]
    IoError {
        #[snafu(source)]
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("No tokio runtime: {source}"))]
    RuntimeUnavailable {
        #[snafu(source)]
        source: tokio::runtime::TryCurrentError,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("index unexpected obj type: {type_name}"))]
    IndexUnexpectedType {
        type_name: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("origin daemon run time panic: {message}"))]
    TunnelPanic {
        message: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("tunnel daemon exited: {status}"))]
    TunnelExited {
        status: ExitStatus,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("invalid resource reference: {value:?}"))]
    InvalidResource {
        value: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },

    #[snafu(display("invalid duration: {value:?}"))]
    InvalidDuration {
        value: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl From<kube::Error> for ControllerError {
    fn from(value: kube::Error) -> Self {
        KubeSnafu.into_error(value)
    }
}

impl From<kube::runtime::watcher::Error> for ControllerError {
    fn from(value: kube::runtime::watcher::Error) -> Self {
        WatcherSnafu.into_error(value)
    }
}

impl From<kube::runtime::reflector::store::WriterDropped> for ControllerError {
    fn from(value: kube::runtime::reflector::store::WriterDropped) -> Self {
        WriterDroppedSnafu.into_error(value)
    }
}

impl From<tokio::time::error::Elapsed> for ControllerError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        CacheSyncTimeoutSnafu.into_error(value)
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(value: std::io::Error) -> Self {
        IoSnafu.into_error(value)
    }
}

impl From<tokio::runtime::TryCurrentError> for ControllerError {
    fn from(value: tokio::runtime::TryCurrentError) -> Self {
        RuntimeUnavailableSnafu.into_error(value)
    }
}

impl ControllerError {
    pub fn index_unexpected_type(type_name: impl Into<String>) -> Self {
        IndexUnexpectedTypeSnafu {
            type_name: type_name.into(),
        }
        .build()
    }

    pub fn tunnel_panic(message: impl Into<String>) -> Self {
        TunnelPanicSnafu {
            message: message.into(),
        }
        .build()
    }

    pub fn tunnel_exited(status: ExitStatus) -> Self {
        TunnelExitedSnafu { status }.build()
    }

    pub fn invalid_resource(value: impl Into<String>) -> Self {
        InvalidResourceSnafu {
            value: value.into(),
        }
        .build()
    }

    pub fn invalid_duration(value: impl Into<String>) -> Self {
        InvalidDurationSnafu {
            value: value.into(),
        }
        .build()
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
