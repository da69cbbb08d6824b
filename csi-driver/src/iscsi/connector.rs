//! The persisted description of one iSCSI attachment.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::disk::IscsiDisk;
use super::error::{IscsiError, Result};

/// Interface name used when none is configured.
pub const DEFAULT_INTERFACE: &str = "default";

/// Secrets type tag recorded for a complete CHAP block.
pub const SECRETS_TYPE_CHAP: &str = "chap";

/// Which phase of the iSCSI exchange a CHAP block authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBlock {
    /// SendTargets discovery (`node.sendtargets.auth.*`)
    Discovery,
    /// Session login (`node.session.auth.*`)
    Session,
}

impl SecretBlock {
    /// Key prefix in the secret blob.
    pub const fn prefix(self) -> &'static str {
        match self {
            SecretBlock::Discovery => "node.sendtargets.auth",
            SecretBlock::Session => "node.session.auth",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SecretBlock::Discovery => "discovery",
            SecretBlock::Session => "session",
        }
    }
}

/// CHAP credentials for one phase. The zero value means no authentication.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Secrets {
    pub username: String,
    pub password: String,
    pub username_in: String,
    pub password_in: String,
    pub secrets_type: String,
}

impl Secrets {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.username_in.is_empty()
            && self.password_in.is_empty()
    }

    /// Extract one CHAP block from a secret map.
    ///
    /// A block with none of its keys present yields the zero value. A block
    /// missing any of the four keys is rejected as a whole.
    pub fn from_map(map: &HashMap<String, String>, block: SecretBlock) -> Result<Self> {
        let prefix = block.prefix();
        let fields = ["username", "password", "username_in", "password_in"];

        let values: Vec<Option<&String>> = fields
            .iter()
            .map(|field| map.get(&format!("{}.{}", prefix, field)))
            .collect();

        if values.iter().all(Option::is_none) {
            return Ok(Self::default());
        }

        let missing: Vec<String> = fields
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(field, _)| format!("{}.{}", prefix, field))
            .collect();

        if !missing.is_empty() {
            return Err(IscsiError::InvalidSecret {
                block: block.name(),
                reason: format!("missing {}", missing.join(", ")),
            });
        }

        let value = |i: usize| values[i].cloned().unwrap_or_default();
        Ok(Self {
            username: value(0),
            password: value(1),
            username_in: value(2),
            password_in: value(3),
            secrets_type: SECRETS_TYPE_CHAP.to_string(),
        })
    }

    /// `(iscsiadm field suffix, value)` pairs for an `-o update` sequence.
    pub(crate) fn auth_fields(&self) -> [(&'static str, &str); 4] {
        [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("username_in", self.username_in.as_str()),
            ("password_in", self.password_in.as_str()),
        ]
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |s: &str| if s.is_empty() { "" } else { "******" };
        f.debug_struct("Secrets")
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("username_in", &self.username_in)
            .field("password_in", &mask(&self.password_in))
            .field("secrets_type", &self.secrets_type)
            .finish()
    }
}

/// Everything needed to reverse an attachment after a restart.
///
/// Built from an [`IscsiDisk`] at attach time and written to disk right after
/// the session is established. Only `multipath_device` changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub volume_name: String,
    pub target_iqn: String,
    pub target_portals: Vec<String>,
    pub lun: i32,
    pub do_chap_discovery: bool,
    #[serde(default)]
    pub discovery_secrets: Secrets,
    #[serde(default)]
    pub session_secrets: Secrets,
    pub interface: String,
    /// Initiator name bound to a non-default interface.
    #[serde(default)]
    pub initiator_name: String,
    #[serde(default)]
    pub multipath_device: String,
}

impl Connector {
    pub fn from_disk(disk: &IscsiDisk) -> Result<Self> {
        if disk.portals.is_empty() {
            return Err(IscsiError::InvalidArgument(format!(
                "volume '{}' has no target portals",
                disk.volume_name
            )));
        }

        let interface = if disk.interface.is_empty() {
            DEFAULT_INTERFACE.to_string()
        } else {
            disk.interface.clone()
        };

        Ok(Self {
            volume_name: disk.volume_name.clone(),
            target_iqn: disk.iqn.clone(),
            target_portals: disk.portals.clone(),
            lun: disk.lun,
            do_chap_discovery: disk.discovery_chap,
            discovery_secrets: disk.discovery_secrets.clone(),
            session_secrets: disk.session_secrets.clone(),
            interface,
            initiator_name: disk.initiator_name.clone(),
            multipath_device: String::new(),
        })
    }

    /// Record the device-mapper alias of the attached LUN. Setting the same
    /// value again is a no-op; a different value is rejected.
    pub fn set_multipath_device(&mut self, device: &str) -> Result<()> {
        if self.multipath_device.is_empty() {
            self.multipath_device = device.to_string();
            return Ok(());
        }
        if self.multipath_device == device {
            return Ok(());
        }
        Err(IscsiError::InvalidArgument(format!(
            "volume '{}' already bound to multipath device {}, refusing {}",
            self.volume_name, self.multipath_device, device
        )))
    }

    /// `/dev/disk/by-path` entry name of the LUN behind `portal`.
    pub fn by_path_name(&self, portal: &str) -> String {
        format!("ip-{}-iscsi-{}-lun-{}", portal, self.target_iqn, self.lun)
    }
}

/// Whether `device` is a device-mapper node rather than a raw SCSI disk.
pub fn is_multipath_device(device: &str) -> bool {
    device.starts_with("/dev/mapper/")
        || device
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with("dm-"))
}
