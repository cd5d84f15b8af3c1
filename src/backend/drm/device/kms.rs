use std::{
    collections::{HashMap, HashSet},
    io,
    num::NonZeroU32,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    path::Path,
    sync::RwLock,
    time::Duration,
};

use drm::{
    buffer::{self, PlanarBuffer},
    control::{
        self, atomic::AtomicModeReq, connector, plane, property, AtomicCommitFlags, Device as ControlDevice,
        FbCmd2Flags, Mode, ResourceHandle,
    },
    ClientCapability, Device as BasicDevice,
};
use tracing::{debug, info, info_span, instrument, trace, warn};

use super::{BlobId, FramebufferDesc, FramebufferId, GemHandle, HdrOutputMetadata, KmsDevice};
use crate::{
    backend::{
        allocator::{Fourcc, Modifier},
        drm::{
            commit::{AtomicRequest, CommitFlags, PropValue},
            error::Error,
            topology::{
                parse_in_formats, ConnectorId, ConnectorInfo, ConnectorStatus, CrtcId, CrtcInfo, ModeInfo,
                PlaneId, PlaneInfo, PlaneKind, Topology,
            },
        },
    },
    utils::{DevPath, DeviceFd},
};

#[derive(Debug)]
struct Card(DeviceFd);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl BasicDevice for Card {}
impl ControlDevice for Card {}

type PropMapping = HashMap<u32, HashMap<String, property::Handle>>;

/// [`KmsDevice`] backed by an open DRM card node
#[derive(Debug)]
pub struct DrmDevice {
    card: Card,
    privileged: bool,
    props: RwLock<PropMapping>,
    span: tracing::Span,
}

const DRM_PLANE_TYPE_OVERLAY: u64 = 0;
const DRM_PLANE_TYPE_PRIMARY: u64 = 1;
const DRM_PLANE_TYPE_CURSOR: u64 = 2;

impl DrmDevice {
    /// Opens the card node at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<DrmDevice, Error> {
        let path = path.as_ref();
        let fd = DeviceFd::open(path).map_err(|source| Error::Access {
            errmsg: "Failed to open device",
            dev: Some(path.to_path_buf()),
            source,
        })?;
        DrmDevice::new(fd)
    }

    /// Wraps an already opened card node
    ///
    /// Tries to become DRM master and enables universal planes and atomic
    /// mode-setting. Property names of all objects are mapped once.
    pub fn new(fd: DeviceFd) -> Result<DrmDevice, Error> {
        let span = info_span!("drm_device", path = ?fd.dev_path());
        let _guard = span.enter();

        let card = Card(fd);
        // Newer kernels grant master to the first client anyway.
        let privileged = match card.acquire_master_lock() {
            Ok(()) => true,
            Err(err) => {
                warn!("Unable to become drm master, assuming unprivileged mode: {}", err);
                false
            }
        };

        for (cap, errmsg) in [
            (ClientCapability::UniversalPlanes, "Error enabling universal planes"),
            (ClientCapability::Atomic, "Error enabling atomic modesetting"),
        ] {
            card.set_client_capability(cap, true).map_err(|source| Error::Access {
                errmsg,
                dev: card.0.dev_path(),
                source,
            })?;
        }

        drop(_guard);
        let dev = DrmDevice {
            card,
            privileged,
            props: RwLock::new(HashMap::new()),
            span,
        };
        dev.map_all_props()?;
        info!(driver = ?dev.driver_name().ok(), "Opened drm device");
        Ok(dev)
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> Error + '_ {
        move |source| Error::Access {
            errmsg,
            dev: self.card.0.dev_path(),
            source,
        }
    }

    fn map_all_props(&self) -> Result<(), Error> {
        let res = self
            .card
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        let planes = self
            .card
            .plane_handles()
            .map_err(self.access("Error loading planes"))?;

        let mut mapping = crate::utils::unpoison(self.props.write());
        mapping.clear();
        map_props(&self.card, res.connectors(), &mut mapping)?;
        map_props(&self.card, res.crtcs(), &mut mapping)?;
        map_props(&self.card, &planes, &mut mapping)?;
        trace!("Mapping: {:#?}", *mapping);
        Ok(())
    }

    fn prop_handle(&self, object: u32, name: &'static str) -> Result<property::Handle, Error> {
        crate::utils::unpoison(self.props.read())
            .get(&object)
            .and_then(|props| props.get(name))
            .copied()
            .ok_or(Error::UnknownProperty { object, name })
    }

    fn prop_names(&self, object: u32) -> HashSet<String> {
        crate::utils::unpoison(self.props.read())
            .get(&object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn prop_values<T: ResourceHandle>(&self, handle: T) -> Result<HashMap<String, u64>, Error> {
        let props = self
            .card
            .get_properties(handle)
            .map_err(self.access("Error reading properties"))?;
        let (handles, values) = props.as_props_and_values();
        let mut result = HashMap::new();
        for (prop, value) in handles.iter().zip(values.iter()) {
            if let Ok(info) = self.card.get_property(*prop) {
                result.insert(info.name().to_string_lossy().into_owned(), *value);
            }
        }
        Ok(result)
    }

    fn crtc_mask(res: &control::ResourceHandles, filter: control::CrtcListFilter) -> u32 {
        let compatible = res.filter_crtcs(filter);
        res.crtcs()
            .iter()
            .enumerate()
            .filter(|(_, crtc)| compatible.contains(crtc))
            .fold(0, |mask, (index, _)| mask | (1 << index))
    }

    fn plane_info(&self, res: &control::ResourceHandles, handle: plane::Handle) -> Result<PlaneInfo, Error> {
        let info = self
            .card
            .get_plane(handle)
            .map_err(self.access("Error loading plane info"))?;
        let values = self.prop_values(handle)?;

        let kind = match values.get("type").copied() {
            Some(DRM_PLANE_TYPE_PRIMARY) => PlaneKind::Primary,
            Some(DRM_PLANE_TYPE_CURSOR) => PlaneKind::Cursor,
            Some(DRM_PLANE_TYPE_OVERLAY) | None => PlaneKind::Overlay,
            Some(other) => {
                debug!(plane = ?handle, kind = other, "Unknown plane type, treating as overlay");
                PlaneKind::Overlay
            }
        };

        let in_formats = values
            .get("IN_FORMATS")
            .filter(|blob| **blob != 0)
            .and_then(|blob| self.card.get_property_blob(*blob).ok())
            .and_then(|data| parse_in_formats(&data));
        let formats = match in_formats {
            Some(formats) => formats,
            None => info
                .formats()
                .iter()
                .filter_map(|code| Fourcc::try_from(*code).ok())
                .map(|fourcc| (fourcc, Default::default()))
                .collect(),
        };

        let id = u32::from(handle);
        Ok(PlaneInfo {
            id: PlaneId(id),
            kind,
            possible_crtcs: Self::crtc_mask(res, info.possible_crtcs()),
            formats,
            zpos: values.get("zpos").map(|zpos| *zpos as i64),
            properties: self.prop_names(id),
        })
    }

    fn connector_info(&self, handle: connector::Handle) -> Result<ConnectorInfo, Error> {
        let res = self
            .card
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        let info = self
            .card
            .get_connector(handle, true)
            .map_err(self.access("Error loading connector info"))?;

        let mut possible_crtcs = 0;
        for encoder in info.encoders() {
            match self.card.get_encoder(*encoder) {
                Ok(encoder) => possible_crtcs |= Self::crtc_mask(&res, encoder.possible_crtcs()),
                Err(err) => debug!(?encoder, "Failed to load encoder: {}", err),
            }
        }

        let edid = self
            .prop_values(handle)?
            .get("EDID")
            .filter(|blob| **blob != 0)
            .and_then(|blob| self.card.get_property_blob(*blob).ok());

        let (mm_width, mm_height) = info.size().unwrap_or((0, 0));
        let id = u32::from(handle);
        Ok(ConnectorInfo {
            id: ConnectorId(id),
            status: match info.state() {
                connector::State::Connected => ConnectorStatus::Connected,
                connector::State::Disconnected => ConnectorStatus::Disconnected,
                connector::State::Unknown => ConnectorStatus::Unknown,
            },
            interface: info.interface().as_str().to_string(),
            mm_width,
            mm_height,
            modes: info.modes().iter().map(mode_info).collect(),
            possible_crtcs,
            properties: self.prop_names(id),
            edid,
        })
    }
}

impl Drop for DrmDevice {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        info!("Dropping device");
        if self.privileged {
            if let Err(err) = self.card.release_master_lock() {
                warn!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

fn map_props<T>(card: &Card, handles: &[T], mapping: &mut PropMapping) -> Result<(), Error>
where
    T: ResourceHandle + Into<u32>,
{
    handles
        .iter()
        .map(|handle| (*handle, card.get_properties(*handle)))
        .try_for_each(|(handle, props)| {
            let props = props?;
            let mut map = HashMap::new();
            let (prop_handles, _) = props.as_props_and_values();
            for prop in prop_handles {
                if let Ok(info) = card.get_property(*prop) {
                    map.insert(info.name().to_string_lossy().into_owned(), *prop);
                }
            }
            mapping.insert(handle.into(), map);
            Ok(())
        })
        .map_err(|source: io::Error| Error::Access {
            errmsg: "Error reading properties",
            dev: card.0.dev_path(),
            source,
        })
}

fn mode_info(mode: &Mode) -> ModeInfo {
    let raw: drm_ffi::drm_mode_modeinfo = (*mode).into();
    let name = raw
        .name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect();
    ModeInfo {
        clock: raw.clock,
        hdisplay: raw.hdisplay,
        hsync_start: raw.hsync_start,
        hsync_end: raw.hsync_end,
        htotal: raw.htotal,
        hskew: raw.hskew,
        vdisplay: raw.vdisplay,
        vsync_start: raw.vsync_start,
        vsync_end: raw.vsync_end,
        vtotal: raw.vtotal,
        vscan: raw.vscan,
        vrefresh: raw.vrefresh,
        flags: raw.flags,
        mode_type: raw.type_,
        name,
    }
}

fn drm_mode(info: &ModeInfo) -> Mode {
    let mut name = [0 as libc::c_char; 32];
    for (dst, src) in name.iter_mut().zip(info.name.bytes().take(31)) {
        *dst = src as libc::c_char;
    }
    Mode::from(drm_ffi::drm_mode_modeinfo {
        clock: info.clock,
        hdisplay: info.hdisplay,
        hsync_start: info.hsync_start,
        hsync_end: info.hsync_end,
        htotal: info.htotal,
        hskew: info.hskew,
        vdisplay: info.vdisplay,
        vsync_start: info.vsync_start,
        vsync_end: info.vsync_end,
        vtotal: info.vtotal,
        vscan: info.vscan,
        vrefresh: info.vrefresh,
        flags: info.flags,
        type_: info.mode_type,
        name,
    })
}

fn buffer_handle(handle: GemHandle) -> Option<buffer::Handle> {
    control::from_u32(handle.0)
}

struct Planar<'a>(&'a FramebufferDesc);

impl<'a> PlanarBuffer for Planar<'a> {
    fn size(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    fn format(&self) -> Fourcc {
        self.0.format
    }

    fn modifier(&self) -> Option<Modifier> {
        self.0.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        self.0.pitches
    }

    fn handles(&self) -> [Option<buffer::Handle>; 4] {
        self.0.handles.map(|handle| handle.and_then(buffer_handle))
    }

    fn offsets(&self) -> [u32; 4] {
        self.0.offsets
    }
}

const DRM_VBLANK_RELATIVE: u32 = 0x1;
const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

#[repr(C)]
#[derive(Clone, Copy)]
struct VblankRequest {
    type_: u32,
    sequence: u32,
    signal: libc::c_ulong,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VblankReply {
    type_: u32,
    sequence: u32,
    tval_sec: libc::c_long,
    tval_usec: libc::c_long,
}

#[repr(C)]
union DrmWaitVblank {
    request: VblankRequest,
    reply: VblankReply,
}

// _IOWR('d', 0x3a, union drm_wait_vblank)
const DRM_IOCTL_WAIT_VBLANK: libc::c_ulong = (3 << 30)
    | ((std::mem::size_of::<DrmWaitVblank>() as libc::c_ulong) << 16)
    | ((b'd' as libc::c_ulong) << 8)
    | 0x3a;

fn vblank_crtc_bits(crtc_index: u32) -> u32 {
    match crtc_index {
        0 => 0,
        1 => DRM_VBLANK_SECONDARY,
        index => (index << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK,
    }
}

impl KmsDevice for DrmDevice {
    fn driver_name(&self) -> Result<String, Error> {
        let driver = self
            .card
            .get_driver()
            .map_err(self.access("Error querying driver"))?;
        Ok(driver.name().to_string_lossy().into_owned())
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn topology(&self) -> Result<Topology, Error> {
        let res = self
            .card
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        let plane_handles = self
            .card
            .plane_handles()
            .map_err(self.access("Error loading planes"))?;

        let crtcs = res
            .crtcs()
            .iter()
            .enumerate()
            .map(|(index, crtc)| {
                let id = u32::from(*crtc);
                CrtcInfo {
                    id: CrtcId(id),
                    index: index as u32,
                    properties: self.prop_names(id),
                }
            })
            .collect();
        let planes = plane_handles
            .iter()
            .map(|plane| self.plane_info(&res, *plane))
            .collect::<Result<Vec<_>, _>>()?;
        let connectors = res
            .connectors()
            .iter()
            .map(|conn| self.connector_info(*conn))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Topology {
            crtcs,
            planes,
            connectors,
        })
    }

    fn probe_connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, Error> {
        let handle: connector::Handle =
            control::from_u32(connector.0).ok_or(Error::UnknownConnector(connector))?;
        let res = self
            .card
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        map_props(&self.card, res.connectors(), &mut *crate::utils::unpoison(self.props.write()))?;
        self.connector_info(handle)
    }

    #[profiling::function]
    fn import_prime(&self, fd: BorrowedFd<'_>) -> Result<GemHandle, Error> {
        let handle = self
            .card
            .prime_fd_to_buffer(fd)
            .map_err(self.access("Failed to import dma-buf"))?;
        Ok(GemHandle(u32::from(handle)))
    }

    fn close_gem(&self, handle: GemHandle) -> Result<(), Error> {
        let Some(raw) = buffer_handle(handle) else {
            return Ok(());
        };
        self.card
            .close_buffer(raw)
            .map_err(self.access("Failed to close buffer handle"))
    }

    #[profiling::function]
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferId, Error> {
        let flags = if desc.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let fb = self
            .card
            .add_planar_framebuffer(&Planar(desc), flags)
            .map_err(self.access("Failed to add framebuffer"))?;
        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<(), Error> {
        let Some(handle) = control::from_u32(fb.0) else {
            return Ok(());
        };
        self.card
            .destroy_framebuffer(handle)
            .map_err(self.access("Failed to destroy framebuffer"))
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> Result<BlobId, Error> {
        let value = self
            .card
            .create_property_blob(&drm_mode(mode))
            .map_err(self.access("Failed to create Property Blob for mode"))?;
        blob_id(value)
    }

    fn create_hdr_blob(&self, metadata: &HdrOutputMetadata) -> Result<BlobId, Error> {
        let value = self
            .card
            .create_property_blob(metadata)
            .map_err(self.access("Failed to create Property Blob for hdr metadata"))?;
        blob_id(value)
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<(), Error> {
        self.card
            .destroy_property_blob(blob.0 as u64)
            .map_err(self.access("Failed to destroy Property Blob"))
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, request))]
    #[profiling::function]
    fn commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error> {
        let mut out_fence: i32 = -1;
        let mut req = AtomicModeReq::new();
        for (object, name, value) in request.iter() {
            let raw_object = object.raw();
            let Some(handle) = NonZeroU32::new(raw_object) else {
                continue;
            };
            let prop = self.prop_handle(raw_object, name)?;
            let raw_value = match value {
                PropValue::Unsigned(v) => v,
                PropValue::Signed(v) => v as u64,
                PropValue::Object(id) | PropValue::Blob(id) => id as u64,
                PropValue::OutFence => &mut out_fence as *mut i32 as u64,
            };
            req.add_raw_property(handle, prop, raw_value);
        }

        let mut drm_flags = AtomicCommitFlags::empty();
        if flags.contains(CommitFlags::TEST_ONLY) {
            drm_flags |= AtomicCommitFlags::TEST_ONLY;
        }
        if flags.contains(CommitFlags::NONBLOCK) {
            drm_flags |= AtomicCommitFlags::NONBLOCK;
        }
        if flags.contains(CommitFlags::ALLOW_MODESET) {
            drm_flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        self.card
            .atomic_commit(drm_flags, req)
            .map_err(self.access("Atomic commit failed"))?;

        if out_fence >= 0 {
            // SAFETY: the kernel wrote a freshly installed fd into the out-fence slot
            Ok(Some(unsafe { OwnedFd::from_raw_fd(out_fence) }))
        } else {
            Ok(None)
        }
    }

    fn wait_vblank(&self, crtc_index: u32) -> Result<Duration, Error> {
        let mut vbl = DrmWaitVblank {
            request: VblankRequest {
                type_: DRM_VBLANK_RELATIVE | vblank_crtc_bits(crtc_index),
                sequence: 1,
                signal: 0,
            },
        };
        loop {
            // SAFETY: `vbl` is a valid drm_wait_vblank union for the whole call
            let ret = unsafe { libc::ioctl(self.card.as_fd().as_raw_fd(), DRM_IOCTL_WAIT_VBLANK as _, &mut vbl) };
            if ret == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Access {
                    errmsg: "Failed to wait for vblank",
                    dev: self.card.0.dev_path(),
                    source: err,
                });
            }
        }
        // SAFETY: a successful ioctl fills in the reply variant
        let reply = unsafe { vbl.reply };
        Ok(Duration::new(reply.tval_sec as u64, reply.tval_usec as u32 * 1000))
    }
}

fn blob_id(value: property::Value<'_>) -> Result<BlobId, Error> {
    match value {
        property::Value::Blob(id) => Ok(BlobId(id as u32)),
        _ => Err(Error::Access {
            errmsg: "Kernel returned no blob id",
            dev: None,
            source: io::Error::from(io::ErrorKind::InvalidData),
        }),
    }
}
