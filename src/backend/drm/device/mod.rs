//! Kernel mode-setting device boundary
//!
//! [`KmsDevice`] is the narrow set of ioctls the composer needs. The real
//! implementation, [`DrmDevice`], sits on top of the `drm` crate.

use std::{
    fmt,
    os::unix::io::{BorrowedFd, OwnedFd},
    time::Duration,
};

use super::{
    commit::{AtomicRequest, CommitFlags},
    topology::{ConnectorId, ConnectorInfo, ModeInfo, Topology},
    Error,
};
use crate::backend::{
    allocator::{Fourcc, Modifier},
    HdrMetadata,
};

#[cfg(feature = "backend_drm")]
mod kms;
#[cfg(feature = "backend_drm")]
pub use self::kms::DrmDevice;

/// Per-device handle of an imported buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GemHandle(pub u32);

/// Kernel framebuffer object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Kernel property blob id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u32);

/// Layout of a framebuffer to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format as scanned out
    pub format: Fourcc,
    /// Explicit modifier, `None` for the implicit layout
    pub modifier: Option<Modifier>,
    /// Buffer object per plane
    pub handles: [Option<GemHandle>; 4],
    /// Bytes per row per plane
    pub pitches: [u32; 4],
    /// Byte offset per plane
    pub offsets: [u32; 4],
}

/// `struct hdr_output_metadata` as consumed by `HDR_OUTPUT_METADATA`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrOutputMetadata {
    /// Always 0, static metadata type 1
    pub metadata_type: u32,
    /// Transfer function, 2 for SMPTE ST 2084
    pub eotf: u8,
    /// Always 0
    pub infoframe_type: u8,
    /// Red, green and blue primaries in units of 0.00002
    pub display_primaries: [[u16; 2]; 3],
    /// White point in units of 0.00002
    pub white_point: [u16; 2],
    /// cd/m²
    pub max_display_mastering_luminance: u16,
    /// Units of 0.0001 cd/m²
    pub min_display_mastering_luminance: u16,
    /// Maximum content light level, cd/m²
    pub max_cll: u16,
    /// Maximum frame-average light level, cd/m²
    pub max_fall: u16,
}

const HDMI_EOTF_SMPTE_ST2084: u8 = 2;

impl From<&HdrMetadata> for HdrOutputMetadata {
    fn from(metadata: &HdrMetadata) -> Self {
        let chroma = |v: f32| (v * 50000.0).round().clamp(0.0, u16::MAX as f32) as u16;
        let nits = |v: f32| v.round().clamp(0.0, u16::MAX as f32) as u16;
        HdrOutputMetadata {
            metadata_type: 0,
            eotf: HDMI_EOTF_SMPTE_ST2084,
            infoframe_type: 0,
            display_primaries: [
                [chroma(metadata.red.0), chroma(metadata.red.1)],
                [chroma(metadata.green.0), chroma(metadata.green.1)],
                [chroma(metadata.blue.0), chroma(metadata.blue.1)],
            ],
            white_point: [chroma(metadata.white_point.0), chroma(metadata.white_point.1)],
            max_display_mastering_luminance: nits(metadata.max_luminance),
            min_display_mastering_luminance: nits(metadata.min_luminance * 10000.0),
            max_cll: nits(metadata.max_content_light_level),
            max_fall: nits(metadata.max_frame_average_light_level),
        }
    }
}

/// The ioctls the composer issues against a mode-setting device
pub trait KmsDevice: Send + Sync + fmt::Debug {
    /// Name of the kernel driver
    fn driver_name(&self) -> Result<String, Error>;

    /// Enumerate CRTCs, planes and connectors
    fn topology(&self) -> Result<Topology, Error>;

    /// Re-read a connector, probing the sink
    fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, Error>;

    /// Import a dma-buf, returning the device local handle
    ///
    /// Importing the same buffer twice yields the same handle.
    fn import_prime(&self, fd: BorrowedFd<'_>) -> Result<GemHandle, Error>;

    /// Release an imported buffer object
    fn close_gem(&self, handle: GemHandle) -> Result<(), Error>;

    /// Create a framebuffer object
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId, Error>;

    /// Destroy a framebuffer object
    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), Error>;

    /// Create a blob holding a mode
    fn create_mode_blob(&self, mode: &ModeInfo) -> Result<BlobId, Error>;

    /// Create a blob holding HDR output metadata
    fn create_hdr_blob(&self, metadata: &HdrOutputMetadata) -> Result<BlobId, Error>;

    /// Destroy a property blob
    fn destroy_blob(&self, blob: BlobId) -> Result<(), Error>;

    /// Submit an atomic transaction, returning the out-fence if one was requested
    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error>;

    /// Block until the next vblank of the CRTC at `crtc_index`, returning its monotonic timestamp
    fn wait_vblank(&self, crtc_index: u32) -> Result<Duration, Error>;
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::backend::drm::topology::ConnectorStatus;
    use rustix::event::{eventfd, EventfdFlags};
    use std::{
        collections::HashMap,
        io,
        os::unix::io::AsRawFd,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    /// In-memory device recording every call
    #[derive(Debug, Default)]
    pub(crate) struct MockDevice {
        pub topology: Mutex<Topology>,
        pub driver: String,
        pub imports: Mutex<HashMap<i32, GemHandle>>,
        pub closed: Mutex<Vec<GemHandle>>,
        pub framebuffers: Mutex<Vec<(FramebufferId, FramebufferDesc)>>,
        pub removed: Mutex<Vec<FramebufferId>>,
        pub blobs: Mutex<Vec<BlobId>>,
        pub destroyed_blobs: Mutex<Vec<BlobId>>,
        pub commits: Mutex<Vec<(AtomicRequest, CommitFlags)>>,
        pub fail_commit: AtomicBool,
        next_id: Mutex<u32>,
    }

    impl MockDevice {
        pub(crate) fn new(topology: Topology) -> MockDevice {
            MockDevice {
                topology: Mutex::new(topology),
                driver: String::from("mock"),
                next_id: Mutex::new(100),
                ..Default::default()
            }
        }

        fn next_id(&self) -> u32 {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            *id
        }

        pub(crate) fn set_connector_status(&self, connector: ConnectorId, status: ConnectorStatus) {
            let mut topology = self.topology.lock().unwrap();
            if let Some(info) = topology.connectors.iter_mut().find(|c| c.id == connector) {
                info.status = status;
            }
        }

        pub(crate) fn last_commit(&self) -> Option<(AtomicRequest, CommitFlags)> {
            self.commits.lock().unwrap().last().cloned()
        }

        pub(crate) fn live_framebuffers(&self) -> usize {
            self.framebuffers.lock().unwrap().len() - self.removed.lock().unwrap().len()
        }
    }

    impl KmsDevice for MockDevice {
        fn driver_name(&self) -> Result<String, Error> {
            Ok(self.driver.clone())
        }

        fn topology(&self) -> Result<Topology, Error> {
            Ok(self.topology.lock().unwrap().clone())
        }

        fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, Error> {
            self.topology
                .lock()
                .unwrap()
                .connectors
                .iter()
                .find(|c| c.id == connector)
                .cloned()
                .ok_or(Error::UnknownConnector(connector))
        }

        fn import_prime(&self, fd: BorrowedFd<'_>) -> Result<GemHandle, Error> {
            let raw = fd.as_raw_fd();
            let existing = self.imports.lock().unwrap().get(&raw).copied();
            Ok(match existing {
                Some(handle) => handle,
                None => {
                    let handle = GemHandle(self.next_id());
                    self.imports.lock().unwrap().insert(raw, handle);
                    handle
                }
            })
        }

        fn close_gem(&self, handle: GemHandle) -> Result<(), Error> {
            self.imports.lock().unwrap().retain(|_, h| *h != handle);
            self.closed.lock().unwrap().push(handle);
            Ok(())
        }

        fn add_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId, Error> {
            let fb = FramebufferId(self.next_id());
            self.framebuffers.lock().unwrap().push((fb, desc.clone()));
            Ok(fb)
        }

        fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), Error> {
            self.removed.lock().unwrap().push(fb);
            Ok(())
        }

        fn create_mode_blob(&self, _mode: &ModeInfo) -> Result<BlobId, Error> {
            let blob = BlobId(self.next_id());
            self.blobs.lock().unwrap().push(blob);
            Ok(blob)
        }

        fn create_hdr_blob(&self, _metadata: &HdrOutputMetadata) -> Result<BlobId, Error> {
            let blob = BlobId(self.next_id());
            self.blobs.lock().unwrap().push(blob);
            Ok(blob)
        }

        fn destroy_blob(&self, blob: BlobId) -> Result<(), Error> {
            self.destroyed_blobs.lock().unwrap().push(blob);
            Ok(())
        }

        fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(Error::Access {
                    errmsg: "Atomic commit failed",
                    dev: None,
                    source: io::Error::from_raw_os_error(libc::EBUSY),
                });
            }
            self.commits.lock().unwrap().push((request.clone(), flags));
            if request.wants_out_fence() && !flags.contains(CommitFlags::TEST_ONLY) {
                Ok(Some(eventfd(0, EventfdFlags::CLOEXEC).unwrap()))
            } else {
                Ok(None)
            }
        }

        fn wait_vblank(&self, _crtc_index: u32) -> Result<Duration, Error> {
            Ok(Duration::ZERO)
        }
    }

    #[test]
    fn hdr_metadata_encoding() {
        let metadata = HdrMetadata {
            red: (0.708, 0.292),
            white_point: (0.3127, 0.329),
            max_luminance: 1000.0,
            min_luminance: 0.05,
            max_content_light_level: 1000.0,
            ..Default::default()
        };
        let raw = HdrOutputMetadata::from(&metadata);
        assert_eq!(raw.eotf, 2);
        assert_eq!(raw.display_primaries[0], [35400, 14600]);
        assert_eq!(raw.white_point, [15635, 16450]);
        assert_eq!(raw.max_display_mastering_luminance, 1000);
        assert_eq!(raw.min_display_mastering_luminance, 500);
    }
}
