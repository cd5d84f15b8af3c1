//! Kernel mode-setting backend
//!
//! This module drives display hardware exposed through the DRM/KMS interface.
//!
//! - [`KmsDevice`] is the boundary to the kernel. [`DrmDevice`] implements it
//!   on top of an open card node, and everything above it only sees the trait.
//! - [`topology`] describes the planes, CRTCs and connectors discovered at
//!   startup and binds them into display pipelines.
//! - [`AtomicRequest`] stages property writes by name; one request is built
//!   per frame and submitted as a single atomic commit.
//! - [`BufferCache`] keeps imported client buffers around as
//!   [`HardwareFramebuffer`]s so repeated frames do not import them again.
//! - [`DrmClient`] ties all of it together and implements
//!   [`DeviceClient`](crate::backend::DeviceClient).
//!
//! ## Frame flow
//!
//! Each [`flush`](crate::backend::DeviceClient::flush) resolves the framebuffer
//! of every plane through the cache (importing on a miss), stages `CRTC_ID`,
//! `FB_ID` and the source and destination rectangles of each plane, disables
//! the planes shown last frame but unused now, adds the mode blob if a modeset
//! is pending and requests an out-fence from the CRTC. The request is then
//! committed in one go. If the commit fails nothing of it is remembered, the
//! caller is expected to present again on the next vsync.
//!
//! ```rust,no_run
//! # #[cfg(feature = "backend_drm")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use hwcomposer::backend::{drm::DrmClient, DeviceClient};
//! use hwcomposer::composer::config::EngineConfig;
//!
//! let client = DrmClient::open("/dev/dri/card0", &EngineConfig::default())?;
//! for display in client.displays() {
//!     println!("{}: {:?}", display, client.configs(display)?);
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "backend_drm"))]
//! # fn main() {}
//! ```

mod cache;
mod client;
pub mod commit;
pub mod device;
mod display;
pub(crate) mod error;
mod framebuffer;
pub mod topology;

pub use self::cache::BufferCache;
pub use self::client::DrmClient;
pub use self::commit::{AtomicRequest, CommitFlags, ObjectRef, PropValue};
#[cfg(feature = "backend_drm")]
pub use self::device::DrmDevice;
pub use self::device::{BlobId, FramebufferDesc, FramebufferId, GemHandle, HdrOutputMetadata, KmsDevice};
pub use self::error::Error;
pub use self::framebuffer::HardwareFramebuffer;
