//! CSI Controller Service Implementation
//!
//! Handles volume and snapshot lifecycle operations by calling the remote
//! volume-management API. The volume context returned from CreateVolume is
//! what the node service later uses to log in to the target.

use std::collections::HashMap;
use std::time::SystemTime;

use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::api_client::{ApiClient, VolumeResponse};
use crate::csi;
use crate::iscsi::{DEFAULT_INTERFACE, normalize_portals};
use crate::metrics::{OperationTimer, status_label};

/// Default volume size: 1GB
const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation and deletion
/// - Volume expansion
/// - Snapshot creation and deletion
/// - Capability reporting and validation
pub struct ControllerService {
    client: ApiClient,
    /// Initiator IQN the API grants access to on volume creation
    initiator_name: String,
}

impl ControllerService {
    pub fn new(client: ApiClient, initiator_name: String) -> Self {
        Self {
            client,
            initiator_name,
        }
    }

    /// Get required volume size from capacity range.
    fn get_volume_size(capacity_range: Option<&csi::CapacityRange>) -> i64 {
        capacity_range
            .map(|range| {
                if range.required_bytes > 0 {
                    range.required_bytes
                } else if range.limit_bytes > 0 {
                    range.limit_bytes
                } else {
                    DEFAULT_VOLUME_SIZE
                }
            })
            .unwrap_or(DEFAULT_VOLUME_SIZE)
    }

    /// Reasons why `capabilities` cannot be served; empty when all are
    /// supported.
    ///
    /// Only filesystem (mount) volumes are served. A regular filesystem
    /// cannot be shared between writers on several nodes, so multi-node
    /// modes are limited to read-only.
    fn unsupported_capabilities(capabilities: &[csi::VolumeCapability]) -> Vec<String> {
        use csi::volume_capability::access_mode::Mode;

        let mut reasons = Vec::new();
        for cap in capabilities {
            match &cap.access_type {
                Some(csi::volume_capability::AccessType::Mount(_)) => {}
                Some(csi::volume_capability::AccessType::Block(_)) => {
                    reasons.push("Block volumes are not supported".to_string());
                }
                None => reasons.push("Volume capability must specify access type".to_string()),
            }

            if let Some(access_mode) = &cap.access_mode {
                match Mode::try_from(access_mode.mode) {
                    Ok(
                        Mode::SingleNodeWriter
                        | Mode::SingleNodeReaderOnly
                        | Mode::MultiNodeReaderOnly
                        | Mode::SingleNodeSingleWriter
                        | Mode::SingleNodeMultiWriter,
                    ) => {}
                    Ok(Mode::MultiNodeSingleWriter) => {
                        reasons.push("MULTI_NODE_SINGLE_WRITER is not supported".to_string());
                    }
                    Ok(Mode::MultiNodeMultiWriter) => reasons.push(
                        "MULTI_NODE_MULTI_WRITER is not supported (requires cluster filesystem)"
                            .to_string(),
                    ),
                    Ok(Mode::Unknown) | Err(_) => {
                        reasons.push(format!("Unknown access mode: {}", access_mode.mode));
                    }
                }
            }
        }
        reasons
    }

    /// Convert an API volume to a CSI volume.
    ///
    /// `parameters` are the StorageClass parameters; extra portals, the iSCSI
    /// interface and the filesystem type are passed through to the node.
    fn api_volume_to_csi(
        volume: &VolumeResponse,
        capacity_bytes: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<csi::Volume, Status> {
        if volume.volume_id.is_empty() || volume.target_portal.is_empty() || volume.iqn.is_empty() {
            return Err(Status::internal(format!(
                "API returned an incomplete volume (volume_id='{}', targetPortal='{}', iqn='{}')",
                volume.volume_id, volume.target_portal, volume.iqn
            )));
        }

        let mut portals: Vec<&str> = vec![volume.target_portal.as_str()];
        if let Some(extra) = parameters.get("portals") {
            portals.extend(extra.split(',').map(str::trim));
        }
        let portals = normalize_portals(portals).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let portals = serde_json::to_string(&portals)
            .map_err(|e| Status::internal(format!("Failed to encode portal list: {}", e)))?;

        let interface = parameters
            .get("iscsiInterface")
            .or_else(|| parameters.get("interface"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());

        let mut volume_context = HashMap::from([
            ("targetPortal".to_string(), volume.target_portal.clone()),
            ("portals".to_string(), portals),
            ("iqn".to_string(), volume.iqn.clone()),
            ("lun".to_string(), volume.lun.clone()),
            ("interface".to_string(), interface),
        ]);
        if !volume.discovery_chap_auth.is_empty() {
            volume_context.insert(
                "discoveryCHAPAuth".to_string(),
                volume.discovery_chap_auth.clone(),
            );
        }
        if !volume.session_chap_auth.is_empty() {
            volume_context.insert(
                "sessionCHAPAuth".to_string(),
                volume.session_chap_auth.clone(),
            );
        }
        if let Some(fs_type) = parameters
            .get("fsType")
            .or_else(|| parameters.get("fs_type"))
        {
            volume_context.insert("fsType".to_string(), fs_type.clone());
        }

        Ok(csi::Volume {
            capacity_bytes,
            volume_id: volume.volume_id.clone(),
            volume_context,
            content_source: None,
            accessible_topology: vec![],
        })
    }

    fn rpc_capability(r#type: csi::controller_service_capability::rpc::Type) -> csi::ControllerServiceCapability {
        csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc {
                    r#type: r#type as i32,
                },
            )),
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();
        let name = &req.name;

        if name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume name is required"));
        }

        let unsupported = Self::unsupported_capabilities(&req.volume_capabilities);
        if !unsupported.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument(unsupported.join("; ")));
        }

        if req.volume_content_source.is_some() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument(
                "Creating a volume from a snapshot or volume is not supported",
            ));
        }

        info!(name = %name, "CreateVolume request");

        let size_bytes = Self::get_volume_size(req.capacity_range.as_ref());

        debug!(
            name = %name,
            size_bytes = size_bytes,
            initiator_name = %self.initiator_name,
            "Creating volume"
        );

        let volume = match self.client.create_volume(&self.initiator_name, size_bytes).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Failed to create volume via API");
                let status = Status::from(e);
                timer.failure(status_label(status.code()));
                return Err(status);
            }
        };

        let csi_volume = match Self::api_volume_to_csi(&volume, size_bytes, &req.parameters) {
            Ok(v) => v,
            Err(status) => {
                timer.failure(status_label(status.code()));
                return Err(status);
            }
        };

        info!(
            volume_id = %volume.volume_id,
            name = %name,
            target_portal = %volume.target_portal,
            iqn = %volume.iqn,
            lun = %volume.lun,
            size_bytes = size_bytes,
            "Volume created successfully"
        );

        timer.success();
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi_volume),
        }))
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        if let Err(e) = self.client.delete_volume(volume_id).await {
            // NOT_FOUND is acceptable - volume may have already been deleted
            if e.is_not_found() {
                warn!(volume_id = %volume_id, "Volume not found, treating as already deleted");
            } else {
                error!(error = %e, "Failed to delete volume via API");
                let status = Status::from(e);
                timer.failure(status_label(status.code()));
                return Err(status);
            }
        }

        info!(volume_id = %volume_id, "Volume deleted successfully");

        timer.success();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let capacity_range = match req.capacity_range.as_ref() {
            Some(r) => r,
            None => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(
                    "Capacity range is required for volume expansion",
                ));
            }
        };

        let new_size_bytes = if capacity_range.required_bytes > 0 {
            capacity_range.required_bytes
        } else {
            capacity_range.limit_bytes
        };

        if new_size_bytes <= 0 {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument(
                "Required or limit bytes must be positive",
            ));
        }

        info!(
            volume_id = %volume_id,
            new_size_bytes = new_size_bytes,
            "ControllerExpandVolume request"
        );

        if let Err(e) = self.client.resize_volume(volume_id, new_size_bytes).await {
            error!(error = %e, "Failed to expand volume via API");
            let status = Status::from(e);
            timer.failure(status_label(status.code()));
            return Err(status);
        }

        info!(
            volume_id = %volume_id,
            new_size_bytes = new_size_bytes,
            "Volume expanded successfully"
        );

        timer.success();
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: new_size_bytes,
            // The LUN grew; the filesystem is grown by NodeExpandVolume.
            node_expansion_required: true,
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = vec![
            Self::rpc_capability(Type::CreateDeleteVolume),
            Self::rpc_capability(Type::CreateDeleteSnapshot),
            Self::rpc_capability(Type::ExpandVolume),
        ];

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let req = request.into_inner();
        let source_volume_id = &req.source_volume_id;
        let name = &req.name;

        if source_volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Source volume ID is required"));
        }

        if name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot name is required"));
        }

        info!(
            source_volume_id = %source_volume_id,
            name = %name,
            "CreateSnapshot request"
        );

        let snapshot = match self.client.create_snapshot(source_volume_id).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to create snapshot via API");
                let status = Status::from(e);
                timer.failure(status_label(status.code()));
                return Err(status);
            }
        };

        info!(
            snapshot_id = %snapshot.snapshot_id,
            source_volume_id = %source_volume_id,
            "Snapshot created successfully"
        );

        timer.success();
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(csi::Snapshot {
                size_bytes: 0,
                snapshot_id: snapshot.snapshot_id,
                source_volume_id: source_volume_id.clone(),
                creation_time: Some(Timestamp::from(SystemTime::now())),
                ready_to_use: true,
                group_snapshot_id: String::new(),
            }),
        }))
    }

    /// Delete a snapshot.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let req = request.into_inner();
        let snapshot_id = &req.snapshot_id;

        if snapshot_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %snapshot_id, "DeleteSnapshot request");

        if let Err(e) = self.client.delete_snapshot(snapshot_id).await {
            // NOT_FOUND is acceptable - snapshot may have already been deleted
            if e.is_not_found() {
                warn!(snapshot_id = %snapshot_id, "Snapshot not found, treating as already deleted");
            } else {
                error!(error = %e, "Failed to delete snapshot via API");
                let status = Status::from(e);
                timer.failure(status_label(status.code()));
                return Err(status);
            }
        }

        info!(snapshot_id = %snapshot_id, "Snapshot deleted successfully");

        timer.success();
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    /// Validate volume capabilities.
    ///
    /// Returns "confirmed" only if ALL requested capabilities are supported.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(volume_id = %volume_id, "ValidateVolumeCapabilities request");

        let unsupported = Self::unsupported_capabilities(&req.volume_capabilities);
        if !unsupported.is_empty() {
            let message = unsupported.join("; ");
            warn!(volume_id = %volume_id, message = %message, "Volume capabilities not supported");
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerPublishVolume is not supported",
        ))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerUnpublishVolume is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerModifyVolume is not supported"))
    }
}
