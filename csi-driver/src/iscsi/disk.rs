//! Request-scoped iSCSI disk descriptor.
//!
//! Built from a publish request's volume context and secrets, never persisted.
//! It is the input to [`Connector::from_disk`](super::Connector::from_disk).

use std::collections::HashMap;

use tracing::debug;

use super::connector::{DEFAULT_INTERFACE, SecretBlock, Secrets};
use super::error::{IscsiError, Result};
use super::portal::normalize_portals;

/// Volume context keys understood by [`IscsiDisk::from_volume_context`].
pub mod keys {
    pub const TARGET_PORTAL: [&str; 2] = ["targetPortal", "target_portal"];
    pub const IQN: [&str; 2] = ["iqn", "target_iqn"];
    pub const LUN: &str = "lun";
    pub const PORTALS: &str = "portals";
    pub const SECRET: &str = "secret";
    pub const INTERFACE: [&str; 2] = ["iscsiInterface", "interface"];
    pub const INITIATOR_NAME: &str = "initiatorName";
    pub const DISCOVERY_CHAP: &str = "discoveryCHAPAuth";
    pub const SESSION_CHAP: &str = "sessionCHAPAuth";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiDisk {
    pub volume_name: String,
    /// Normalized `host:port` portals, primary first.
    pub portals: Vec<String>,
    pub iqn: String,
    pub lun: i32,
    pub interface: String,
    pub initiator_name: String,
    pub discovery_chap: bool,
    pub session_chap: bool,
    pub discovery_secrets: Secrets,
    pub session_secrets: Secrets,
}

impl IscsiDisk {
    /// Build a descriptor from a publish request.
    ///
    /// The CHAP blob comes from the `secret` context key (a JSON object) and
    /// falls back to the request's secret map.
    pub fn from_volume_context(
        volume_name: &str,
        context: &HashMap<String, String>,
        request_secrets: &HashMap<String, String>,
    ) -> Result<Self> {
        if volume_name.is_empty() {
            return Err(IscsiError::InvalidArgument("volume name is required".into()));
        }

        let target_portal = lookup(context, &keys::TARGET_PORTAL).ok_or_else(|| {
            IscsiError::InvalidArgument("targetPortal is required in volume context".into())
        })?;
        let iqn = lookup(context, &keys::IQN)
            .ok_or_else(|| IscsiError::InvalidArgument("iqn is required in volume context".into()))?;

        let lun_raw = context
            .get(keys::LUN)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IscsiError::InvalidArgument("lun is required in volume context".into()))?;
        let lun = lun_raw.parse::<i32>().ok().filter(|l| *l >= 0).ok_or_else(|| {
            IscsiError::InvalidArgument(format!("lun '{}' is not a valid LUN number", lun_raw))
        })?;

        let extra_portals = match context.get(keys::PORTALS).map(|s| s.trim()) {
            Some(raw) if !raw.is_empty() => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
                IscsiError::InvalidArgument(format!("portals must be a JSON array of strings: {}", e))
            })?,
            _ => Vec::new(),
        };

        let portals = normalize_portals(
            std::iter::once(target_portal).chain(extra_portals.iter().map(String::as_str)),
        )?;

        let interface = lookup(context, &keys::INTERFACE)
            .unwrap_or(DEFAULT_INTERFACE)
            .to_string();
        let initiator_name = context
            .get(keys::INITIATOR_NAME)
            .cloned()
            .unwrap_or_default();

        let secret_map = secret_map(context, request_secrets)?;
        let discovery_block = Secrets::from_map(&secret_map, SecretBlock::Discovery)?;
        let session_block = Secrets::from_map(&secret_map, SecretBlock::Session)?;

        let discovery_chap = chap_flag(context, keys::DISCOVERY_CHAP)?
            .unwrap_or(!discovery_block.is_empty());
        let session_chap =
            chap_flag(context, keys::SESSION_CHAP)?.unwrap_or(!session_block.is_empty());

        if discovery_chap && discovery_block.is_empty() {
            return Err(IscsiError::InvalidSecret {
                block: SecretBlock::Discovery.name(),
                reason: "discovery CHAP enabled but no node.sendtargets.auth.* secrets supplied"
                    .into(),
            });
        }
        if session_chap && session_block.is_empty() {
            return Err(IscsiError::InvalidSecret {
                block: SecretBlock::Session.name(),
                reason: "session CHAP enabled but no node.session.auth.* secrets supplied".into(),
            });
        }

        debug!(
            volume = %volume_name,
            portals = ?portals,
            iqn = %iqn,
            lun = lun,
            discovery_chap = discovery_chap,
            session_chap = session_chap,
            "Resolved iSCSI disk"
        );

        Ok(Self {
            volume_name: volume_name.to_string(),
            portals,
            iqn: iqn.to_string(),
            lun,
            interface,
            initiator_name,
            discovery_chap,
            session_chap,
            discovery_secrets: if discovery_chap {
                discovery_block
            } else {
                Secrets::default()
            },
            session_secrets: if session_chap {
                session_block
            } else {
                Secrets::default()
            },
        })
    }
}

/// First non-empty value among `names`.
fn lookup<'a>(context: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| context.get(*name))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Explicit `"true"`/`"false"` flag, `None` when absent.
fn chap_flag(context: &HashMap<String, String>, key: &str) -> Result<Option<bool>> {
    match context.get(key).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) if v == "true" => Ok(Some(true)),
        Some(v) if v == "false" => Ok(Some(false)),
        Some(v) => Err(IscsiError::InvalidArgument(format!(
            "{} must be 'true' or 'false', got '{}'",
            key, v
        ))),
    }
}

fn secret_map(
    context: &HashMap<String, String>,
    request_secrets: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    match context.get(keys::SECRET).map(|s| s.trim()) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            IscsiError::InvalidArgument(format!("secret must be a JSON object of strings: {}", e))
        }),
        _ => Ok(request_secrets.clone()),
    }
}
