//! iSCSI CSI Driver Library
//!
//! Kubernetes CSI driver that attaches iSCSI volumes on the node and
//! manages their lifecycle through a remote volume-management API.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - The iSCSI attach/detach engine (sessions, devices, persisted connectors)
//! - An HTTP client for the volume-management API
//! - Platform mount/format operations

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod api_client;
pub mod config;
pub mod controller;
pub mod identity;
pub mod iscsi;
pub mod metrics;
pub mod node;
pub mod platform;

pub use api_client::{ApiClient, ApiError};
pub use config::{CliArgs, CsiEndpoint, DriverConfig};
pub use controller::ControllerService;
pub use identity::{DRIVER_VERSION, IdentityService};
pub use node::NodeService;
