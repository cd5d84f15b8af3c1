use crate::backend;

use super::{config::ConfigId, layer::LayerId, DisplayId};

/// Errors reported through the composition control interface
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The display id is unknown
    #[error("Unknown display {0}")]
    BadDisplay(DisplayId),
    /// The layer id is unknown on this display
    #[error("Unknown layer {0}")]
    BadLayer(LayerId),
    /// The config id is unknown on this display, or no config is active
    #[error("Unknown or missing display config {0:?}")]
    BadConfig(Option<ConfigId>),
    /// An argument is out of range
    #[error("Invalid parameter: {0}")]
    BadParameter(&'static str),
    /// Import, allocation or commit failed at the hardware boundary
    #[error("Out of resources: {errmsg}")]
    NoResources {
        /// What was attempted
        errmsg: &'static str,
        /// Underlying backend error
        #[source]
        source: Option<backend::Error>,
    },
    /// The capability is not implemented
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    /// The operation was called out of order
    #[error("Display was not validated")]
    NotValidated,
    /// A seamless config change was requested across config groups
    #[error("Seamless config change not possible")]
    SeamlessNotAllowed,
}

impl From<backend::Error> for Error {
    fn from(err: backend::Error) -> Self {
        match err {
            backend::Error::UnknownDisplay(display) => Error::BadDisplay(display),
            backend::Error::UnknownConfig(config) => Error::BadConfig(Some(config)),
            backend::Error::Unsupported(what) => Error::Unsupported(what),
            source => Error::NoResources {
                errmsg: "Backend operation failed",
                source: Some(source),
            },
        }
    }
}
