//! CSI Node Service Implementation
//!
//! Publishes iSCSI volumes directly at the pod target path: log in to the
//! target, persist the connector, format if needed and mount. Unpublish
//! reverses this using the persisted connector.
//!
//! All iSCSI and filesystem work blocks, so it runs on the blocking pool via
//! `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::csi;
use crate::iscsi::{
    AttachOutcome, DetachOutcome, IscsiDisk, IscsiError, MountRequest, UnmountRequest,
    VolumeAttacher,
};
use crate::metrics::{self, OperationTimer};
use crate::platform;

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume publishing (iSCSI login, format if needed, mount at target path)
/// - Volume unpublishing (unmount, device removal, logout)
/// - Online filesystem expansion
/// - Node capability reporting
pub struct NodeService {
    /// The node identifier for this CSI node
    node_id: String,
    attacher: Arc<VolumeAttacher>,
}

impl NodeService {
    pub fn new(node_id: String, attacher: Arc<VolumeAttacher>) -> Self {
        Self { node_id, attacher }
    }

    /// Validate that a path is safe to use in shell commands.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow dangerous characters that could enable shell injection
        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// Validate that an IQN is safe to pass to iscsiadm.
    fn validate_target_name(target: &str) -> Result<(), Status> {
        if target.is_empty() {
            return Err(Status::invalid_argument("Target name cannot be empty"));
        }

        // Target names should only contain alphanumeric, dots, colons, and dashes
        let valid = target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-' || c == '_');

        if !valid {
            return Err(Status::invalid_argument(
                "Target name contains invalid characters",
            ));
        }

        Ok(())
    }

    /// Build the attach request for a publish call.
    fn mount_request(req: &csi::NodePublishVolumeRequest) -> Result<MountRequest, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;

        let (fs_type_raw, mount_flags) = match &capability.access_type {
            Some(csi::volume_capability::AccessType::Mount(mount)) => {
                (mount.fs_type.as_str(), mount.mount_flags.clone())
            }
            Some(csi::volume_capability::AccessType::Block(_)) => {
                return Err(Status::invalid_argument(
                    "Raw block volumes are not supported",
                ));
            }
            None => ("", Vec::new()),
        };
        let fs_type_raw = if fs_type_raw.is_empty() {
            req.volume_context
                .get("fsType")
                .or_else(|| req.volume_context.get("fs_type"))
                .map(String::as_str)
                .unwrap_or("")
        } else {
            fs_type_raw
        };
        let fs_type = platform::validate_fs_type(fs_type_raw)?;

        let read_only_mode = capability.access_mode.as_ref().is_some_and(|m| {
            matches!(
                csi::volume_capability::access_mode::Mode::try_from(m.mode),
                Ok(csi::volume_capability::access_mode::Mode::SingleNodeReaderOnly
                    | csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly)
            )
        });

        let disk = IscsiDisk::from_volume_context(&req.volume_id, &req.volume_context, &req.secrets)?;
        Self::validate_target_name(&disk.iqn)?;

        Ok(MountRequest::new(
            disk,
            PathBuf::from(&req.target_path),
            fs_type,
            mount_flags,
            req.readonly || read_only_mode,
        )?)
    }

    async fn publish(
        &self,
        req: csi::NodePublishVolumeRequest,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let request = Self::mount_request(&req)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            target_iqn = %request.connector.target_iqn,
            portals = ?request.connector.target_portals,
            lun = request.connector.lun,
            fs_type = %request.fs_type,
            readonly = request.read_only,
            "NodePublishVolume request"
        );

        let attacher = self.attacher.clone();
        let outcome = run_blocking(move || {
            attacher.attach_disk(&request).map_err(Status::from)
        })
        .await?;

        match outcome {
            AttachOutcome::Mounted { device } => info!(
                volume_id = %req.volume_id,
                device = %device,
                target_path = %req.target_path,
                "Volume published successfully"
            ),
            AttachOutcome::AlreadyMounted { device } => info!(
                volume_id = %req.volume_id,
                device = %device,
                target_path = %req.target_path,
                "Volume already published"
            ),
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn unpublish(
        &self,
        req: csi::NodeUnpublishVolumeRequest,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        let request = UnmountRequest {
            volume_name: req.volume_id.clone(),
            target_path: PathBuf::from(&req.target_path),
        };
        let attacher = self.attacher.clone();
        let outcome = run_blocking(move || {
            attacher.detach_disk(&request).map_err(Status::from)
        })
        .await?;

        let label = match outcome {
            DetachOutcome::AlreadyClean => "already_clean",
            DetachOutcome::AlreadyDetached => "already_detached",
            DetachOutcome::StillInUse(_) => "still_in_use",
            DetachOutcome::Detached => "detached",
        };
        metrics::record_detach(label);

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            outcome = ?outcome,
            "Volume unpublished successfully"
        );

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn expand(
        &self,
        req: csi::NodeExpandVolumeRequest,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("Volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        let attacher = self.attacher.clone();
        let volume_id = req.volume_id.clone();
        let volume_path = PathBuf::from(&req.volume_path);
        let capacity_bytes = run_blocking(move || {
            expand_filesystem(&attacher, &volume_id, &volume_path)
        })
        .await?;

        info!(
            volume_id = %req.volume_id,
            capacity_bytes = capacity_bytes,
            "Volume expansion completed"
        );

        Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
    }
}

/// Rescan the sessions behind `volume_path`, grow its filesystem and return
/// the new size.
fn expand_filesystem(
    attacher: &VolumeAttacher,
    volume_id: &str,
    volume_path: &Path,
) -> Result<i64, Status> {
    let mounter = attacher.mounter();
    let mount = mounter.find_mount(volume_path)?.ok_or_else(|| {
        Status::not_found(format!("Volume path {} is not mounted", volume_path.display()))
    })?;

    match attacher.store().load(volume_id) {
        Ok(connector) => attacher.sessions().rescan(&connector)?,
        Err(IscsiError::NotFound(path)) => {
            warn!(volume_id = %volume_id, path = %path, "No connector file, skipping session rescan")
        }
        Err(e) => return Err(e.into()),
    }

    mounter.resize_filesystem(&mount.device, volume_path, &mount.fs_type)?;
    Ok(mounter.filesystem_capacity(volume_path)?)
}

/// Run blocking node work off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, Status>
where
    F: FnOnce() -> Result<T, Status> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Status::internal(format!("Node task failed: {}", e)))?
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeStageVolume is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("NodeUnstageVolume is not supported"))
    }

    /// Attach the iSCSI volume and mount it at the target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let result = self.publish(request.into_inner()).await;
        timer.finish(&result);
        result
    }

    /// Unmount the target path and tear down the iSCSI attachment once the
    /// device is no longer mounted anywhere.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let result = self.unpublish(request.into_inner()).await;
        timer.finish(&result);
        result
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::ExpandVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Grow the filesystem after the controller expanded the LUN.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        let result = self.expand(request.into_inner()).await;
        timer.finish(&result);
        result
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn publish_request(context: &[(&str, &str)]) -> csi::NodePublishVolumeRequest {
        csi::NodePublishVolumeRequest {
            volume_id: "vol-1".to_string(),
            target_path: "/var/lib/kubelet/pods/p1/volumes/vol-1/mount".to_string(),
            volume_capability: Some(csi::VolumeCapability {
                access_type: Some(csi::volume_capability::AccessType::Mount(
                    csi::volume_capability::MountVolume {
                        fs_type: "ext4".to_string(),
                        mount_flags: vec!["noatime".to_string()],
                        volume_mount_group: String::new(),
                    },
                )),
                access_mode: Some(csi::volume_capability::AccessMode {
                    mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
                }),
            }),
            volume_context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn context() -> Vec<(&'static str, &'static str)> {
        vec![
            ("targetPortal", "10.0.0.5"),
            ("iqn", "iqn.2025-01.test:vol1"),
            ("lun", "0"),
        ]
    }

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/kubelet/pods/x/mount").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
        assert!(NodeService::validate_path("/a/b/c/d/e").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        // Empty path
        assert!(NodeService::validate_path("").is_err());

        // Relative path
        assert!(NodeService::validate_path("var/lib").is_err());

        // Path traversal
        assert!(NodeService::validate_path("/var/../etc").is_err());

        // Dangerous characters
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var|cat").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
    }

    #[test]
    fn test_validate_target_name() {
        assert!(NodeService::validate_target_name("iqn.2025-01.test:vol1").is_ok());
        assert!(NodeService::validate_target_name("").is_err());
        assert!(NodeService::validate_target_name("target;rm -rf").is_err());
        assert!(NodeService::validate_target_name("target$(id)").is_err());
    }

    #[test]
    fn test_mount_request_from_publish() {
        let request = NodeService::mount_request(&publish_request(&context())).unwrap();

        assert_eq!(request.connector.target_portals, vec!["10.0.0.5:3260"]);
        assert_eq!(request.connector.target_iqn, "iqn.2025-01.test:vol1");
        assert_eq!(request.fs_type, "ext4");
        assert!(!request.read_only);
        assert_eq!(request.mount_options(), vec!["rw", "noatime"]);
    }

    #[test]
    fn test_mount_request_reader_only_mode() {
        let mut req = publish_request(&context());
        if let Some(cap) = req.volume_capability.as_mut() {
            cap.access_mode = Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::MultiNodeReaderOnly as i32,
            });
        }
        let request = NodeService::mount_request(&req).unwrap();
        assert!(request.read_only);
    }

    #[test]
    fn test_mount_request_rejects_invalid_input() {
        let mut req = publish_request(&context());
        req.volume_capability = None;
        assert_eq!(
            NodeService::mount_request(&req).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );

        let mut req = publish_request(&context());
        if let Some(cap) = req.volume_capability.as_mut() {
            cap.access_type = Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            ));
        }
        assert!(NodeService::mount_request(&req).is_err());

        let mut req = publish_request(&context());
        if let Some(csi::volume_capability::AccessType::Mount(m)) = req
            .volume_capability
            .as_mut()
            .and_then(|c| c.access_type.as_mut())
        {
            m.fs_type = "btrfs".to_string();
        }
        assert_eq!(
            NodeService::mount_request(&req).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );

        let req = publish_request(&[("targetPortal", "10.0.0.5"), ("lun", "0")]);
        assert!(NodeService::mount_request(&req).is_err());

        let req = publish_request(&[
            ("targetPortal", "10.0.0.5"),
            ("iqn", "iqn.bad;reboot"),
            ("lun", "0"),
        ]);
        assert!(NodeService::mount_request(&req).is_err());
    }

    #[test]
    fn test_mount_request_partial_secret_rejected() {
        let mut req = publish_request(&context());
        req.secrets = HashMap::from([
            ("node.session.auth.username".to_string(), "u".to_string()),
            ("node.session.auth.password".to_string(), "p".to_string()),
        ]);
        let err = NodeService::mount_request(&req).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(!err.message().contains("\"p\""));
    }
}
