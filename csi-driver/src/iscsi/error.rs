use thiserror::Error;
use tonic::Status;

use crate::platform::PlatformError;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid {block} CHAP secret: {reason}")]
    InvalidSecret { block: &'static str, reason: String },

    #[error("failed to connect volume '{volume}' to target '{iqn}': {reason}")]
    Connect {
        volume: String,
        iqn: String,
        reason: String,
    },

    #[error("failed to persist connector for volume '{volume}' to {path}: {source}")]
    Persist {
        volume: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connector file {0} not found")]
    NotFound(String),

    #[error("connector file {path} is corrupt: {source}")]
    CorruptConnector {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to mount {device} at {target}: {source}")]
    Mount {
        device: String,
        target: String,
        #[source]
        source: PlatformError,
    },

    #[error("failed to unmount {target}: {source}")]
    Unmount {
        target: String,
        #[source]
        source: PlatformError,
    },

    #[error("failed to remove devices of volume '{volume}': {reason}")]
    Disconnect { volume: String, reason: String },

    #[error("failed to log out of target '{iqn}' on portal {portal}: {reason}")]
    Logout {
        iqn: String,
        portal: String,
        reason: String,
    },

    #[error("{command} failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IscsiError>;

impl From<IscsiError> for Status {
    fn from(err: IscsiError) -> Self {
        match err {
            IscsiError::InvalidArgument(_) | IscsiError::InvalidSecret { .. } => {
                Status::invalid_argument(err.to_string())
            }
            IscsiError::NotFound(_) => Status::not_found(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status: Status = IscsiError::InvalidArgument("lun is required".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: Status = IscsiError::InvalidSecret {
            block: "session",
            reason: "missing node.session.auth.password".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: Status = IscsiError::NotFound("/var/run/x/iscsi-v.json".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: Status = IscsiError::Connect {
            volume: "vol-1".into(),
            iqn: "iqn.2025-01.test:vol1".into(),
            reason: "10.0.0.5:3260: connection refused".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("vol-1"));
        assert!(status.message().contains("10.0.0.5:3260"));
    }
}
