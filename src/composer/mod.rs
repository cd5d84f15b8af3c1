//! Client facing composition engine
//!
//! A [`Composer`] owns one [`Display`] per connected output of a
//! [`DeviceClient`](crate::backend::DeviceClient). Every display runs the
//! validate, accept, present cycle:
//!
//! - [`Display::validate`] decides which layers go to overlay planes and which
//!   are blended, and proposes composition type changes,
//! - [`Display::accept_changes`] applies those proposals to the layers,
//! - [`Display::present`] shows the frame and hands back fences.
//!
//! Calling these out of order fails with [`Error::NotValidated`].

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::utils::unpoison;

pub mod config;
mod device;
mod display;
mod error;
pub mod layer;
pub mod store;
pub mod strategy;
pub mod vsync;

pub use crate::backend::DisplayId;

pub use self::device::Composer;
pub use self::display::{
    ColorMode, ConfigChangeConstraints, ContentType, Display, DisplayAttribute, PresentFences, PresentState,
    RenderIntent, LEGACY_EDID,
};
pub use self::error::Error;
pub use self::vsync::VsyncTimeline;

/// Receiver of asynchronous engine events
///
/// Called from hotplug and vsync threads; implementations must not block.
pub trait ComposerCallback: Send + Sync {
    /// A display was connected or disconnected
    fn on_hotplug(&self, display: DisplayId, connected: bool);

    /// A display refreshed
    fn on_vsync(&self, display: DisplayId, timestamp: Duration, period: Duration);

    /// A display needs a new frame, for example after a deferred mode change
    fn on_refresh(&self, _display: DisplayId) {}
}

/// Shared slot holding the registered [`ComposerCallback`]
#[derive(Clone, Default)]
pub(crate) struct CallbackSlot(Arc<RwLock<Option<Arc<dyn ComposerCallback>>>>);

impl CallbackSlot {
    pub(crate) fn set(&self, callback: Option<Arc<dyn ComposerCallback>>) {
        *unpoison(self.0.write()) = callback;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn ComposerCallback>> {
        unpoison(self.0.read()).clone()
    }
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackSlot")
            .field(&self.get().is_some())
            .finish()
    }
}
