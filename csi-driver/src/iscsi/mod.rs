//! Node-side iSCSI attachment.
//!
//! A publish request becomes an [`IscsiDisk`], which yields a [`Connector`].
//! The [`VolumeAttacher`] logs in through a [`SessionConnector`], persists the
//! connector in a [`ConnectorStore`] and mounts the device. Unpublish reloads
//! the connector from the store, so detach works across driver restarts.

pub mod attach;
pub mod connector;
pub mod disk;
pub mod error;
pub mod persist;
pub mod portal;
pub mod session;

pub use attach::{AttachOutcome, DetachOutcome, MountRequest, UnmountRequest, VolumeAttacher};
pub use connector::{Connector, DEFAULT_INTERFACE, SecretBlock, Secrets, is_multipath_device};
pub use disk::IscsiDisk;
pub use error::{IscsiError, Result};
pub use persist::{ConnectorStore, load_connector, persist_connector};
pub use portal::{DEFAULT_ISCSI_PORT, Portal, normalize_portals};
pub use session::{DevicePaths, DeviceWaitPolicy, IscsiAdm, SessionConnector};
