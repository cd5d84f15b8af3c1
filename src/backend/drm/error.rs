use std::{io, path::PathBuf};

use super::topology::{ConnectorId, CrtcId, PlaneId};

/// Errors thrown by the [`KmsDevice`](super::KmsDevice) and the [`DrmClient`](super::DrmClient)
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to acquire DRM master
    #[error("Failed to acquire DRM master")]
    DrmMasterFailed,
    /// The device encountered an access error
    #[error("DRM access error: {errmsg} on device `{dev:?}` ({source})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Device on which the error was generated
        dev: Option<PathBuf>,
        /// Underlying device error
        #[source]
        source: io::Error,
    },
    /// The device is missing a required property
    #[error("The device is missing a required property '{name}' for object {object}")]
    UnknownProperty {
        /// Object id
        object: u32,
        /// Property name
        name: &'static str,
    },
    /// Plane is not part of any pipeline of this device
    #[error("Unknown plane {0:?}")]
    UnknownPlane(PlaneId),
    /// CRTC is not known to the device
    #[error("Unknown crtc {0:?}")]
    UnknownCrtc(CrtcId),
    /// Connector is not known to the device
    #[error("Unknown connector {0:?}")]
    UnknownConnector(ConnectorId),
    /// The buffer cannot be scanned out
    #[error("Buffer with {planes} planes cannot be imported")]
    UnsupportedBuffer {
        /// Amount of planes of the buffer
        planes: usize,
    },
    /// The display has no mode to program
    #[error("No mode set for crtc {0:?}")]
    NoMode(CrtcId),
}
