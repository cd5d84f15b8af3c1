//! Per-pipeline state of the DRM client and the atomic request it commits every frame

use std::{
    collections::HashSet,
    os::unix::io::AsRawFd,
    sync::Arc,
    time::Duration,
};

use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    cache::BufferCache,
    commit::{AtomicRequest, CommitFlags, ObjectRef, PropValue},
    device::{BlobId, HdrOutputMetadata, KmsDevice},
    framebuffer::HardwareFramebuffer,
    topology::{configs_from_modes, select_active, ConnectorInfo, ModeInfo, Pipeline},
    Error,
};
use crate::{
    backend::{
        allocator::ClientBuffer, sync::Fence, DisplayConfigs, DisplayId, FrameRequest, HdrMetadata, PlaneId,
        PowerMode,
    },
    composer::config::{ConfigId, DisplayConfig, PreferredMode, UiScale},
    utils::{Buffer, Display, Rectangle},
};

/// Size of the config shown by a disconnected primary display that never had a mode
const PLACEHOLDER_SIZE: (i32, i32) = (720, 1280);
const PLACEHOLDER_REFRESH: u32 = 60;
const PLACEHOLDER_DPI: f32 = 160.0;

#[derive(Debug)]
pub(super) struct DrmDisplay {
    pub id: DisplayId,
    pub pipeline: Pipeline,
    pub primary: bool,
    /// Connector state as last probed
    pub connected: bool,
    pub configs: Vec<DisplayConfig>,
    pub active: Option<ConfigId>,
    pub power: PowerMode,
    modeset_pending: bool,
    mode_blob: Option<BlobId>,
    hdr_metadata: Option<HdrMetadata>,
    hdr_blob: Option<BlobId>,
    content_protection: Option<bool>,
    /// Planes showing content since the last successful commit
    active_planes: HashSet<PlaneId>,
    /// Framebuffers on screen since the last successful commit
    on_screen: Vec<Arc<HardwareFramebuffer>>,
    span: tracing::Span,
}

/// A request ready for submission plus everything that must outlive the commit
pub(super) struct PreparedFrame {
    pub request: AtomicRequest,
    pub flags: CommitFlags,
    framebuffers: Vec<Arc<HardwareFramebuffer>>,
    planes: HashSet<PlaneId>,
    new_mode_blob: Option<BlobId>,
    new_hdr_blob: Option<BlobId>,
    _fences: Vec<Fence>,
}

impl DrmDisplay {
    pub fn new(id: DisplayId, pipeline: Pipeline, primary: bool) -> DrmDisplay {
        let span = tracing::info_span!("drm_display", display = id, crtc = pipeline.crtc.id.0);
        DrmDisplay {
            id,
            connected: false,
            pipeline,
            primary,
            configs: Vec::new(),
            active: None,
            power: PowerMode::On,
            modeset_pending: false,
            mode_blob: None,
            hdr_metadata: None,
            hdr_blob: None,
            content_protection: None,
            active_planes: HashSet::new(),
            on_screen: Vec::new(),
            span,
        }
    }

    /// Whether the display is reported as connected
    ///
    /// A primary display never disappears.
    pub fn reported_connected(&self) -> bool {
        self.primary || self.connected
    }

    pub fn display_configs(&self) -> DisplayConfigs {
        DisplayConfigs {
            configs: self.configs.clone(),
            active: self.active,
        }
    }

    pub fn config(&self, id: ConfigId) -> Option<&DisplayConfig> {
        self.configs.iter().find(|config| config.id == id)
    }

    pub fn active_config(&self) -> Option<&DisplayConfig> {
        self.active.and_then(|id| self.config(id))
    }

    fn active_mode(&self) -> Option<&ModeInfo> {
        let config = self.active_config()?;
        (config.mode_id as usize)
            .checked_sub(1)
            .and_then(|index| self.pipeline.connector.modes.get(index))
    }

    /// Rebuilds the config set from a freshly probed connector
    ///
    /// Config ids continue from `next_id`, so ids of earlier connections are never reused.
    pub fn connect(&mut self, connector: ConnectorInfo, next_id: &mut ConfigId, preferred: Option<&PreferredMode>) {
        let _guard = self.span.enter();
        self.pipeline.connector = connector;
        self.configs = configs_from_modes(&self.pipeline.connector, *next_id);
        *next_id += self.configs.len() as ConfigId;
        self.active = select_active(&self.configs, &self.pipeline.connector.modes, preferred);
        self.connected = true;
        self.modeset_pending = self.active.is_some();
        info!(
            configs = self.configs.len(),
            active = ?self.active,
            "Display connected"
        );
    }

    /// Forgets the sink; a primary display falls back to a placeholder config
    pub fn disconnect(&mut self, connector: ConnectorInfo, next_id: &mut ConfigId) {
        let _guard = self.span.enter();
        self.pipeline.connector = connector;
        self.connected = false;
        self.modeset_pending = false;
        if self.primary {
            let mut placeholder = self.active_config().cloned().unwrap_or_else(|| {
                DisplayConfig::new(
                    0,
                    PLACEHOLDER_SIZE.0,
                    PLACEHOLDER_SIZE.1,
                    PLACEHOLDER_REFRESH,
                    PLACEHOLDER_DPI,
                )
            });
            placeholder.id = *next_id;
            placeholder.mode_id = 0;
            *next_id += 1;
            self.active = Some(placeholder.id);
            self.configs = vec![placeholder];
        } else {
            self.configs.clear();
            self.active = None;
        }
        info!(primary = self.primary, "Display disconnected");
    }

    pub fn set_active_config(&mut self, config: ConfigId) -> bool {
        if self.config(config).is_none() {
            return false;
        }
        if self.active != Some(config) {
            debug!(parent: &self.span, config, "Switching config");
            self.active = Some(config);
            self.modeset_pending = true;
        }
        true
    }

    pub fn power_on(&mut self) {
        self.power = PowerMode::On;
        if self.connected {
            self.modeset_pending = true;
        }
    }

    pub fn set_content_protection(&mut self, enabled: bool) {
        self.content_protection = Some(enabled);
    }

    /// Stores new static HDR metadata, programmed with the next modeset
    pub fn set_hdr_metadata(&mut self, metadata: Option<HdrMetadata>) {
        if self.hdr_metadata != metadata && self.pipeline.connector.has_property("HDR_OUTPUT_METADATA") {
            self.hdr_metadata = metadata;
            if self.connected {
                self.modeset_pending = true;
            }
        }
    }

    /// Builds the request turning the pipeline off
    pub fn power_off_request(&self) -> AtomicRequest {
        let mut req = AtomicRequest::new();
        let crtc = ObjectRef::Crtc(self.pipeline.crtc.id);
        req.set(
            ObjectRef::Connector(self.pipeline.connector.id),
            "CRTC_ID",
            PropValue::Object(0),
        );
        req.set(crtc, "ACTIVE", PropValue::Unsigned(0));
        req.set(crtc, "MODE_ID", PropValue::Blob(0));
        req.disable_plane(self.pipeline.primary.id);
        for plane in &self.active_planes {
            req.disable_plane(*plane);
        }
        req
    }

    /// Records a successful power-off commit
    pub fn powered_off(&mut self, device: &dyn KmsDevice) {
        self.power = PowerMode::Off;
        self.active_planes.clear();
        self.on_screen.clear();
        if let Some(blob) = self.mode_blob.take() {
            if let Err(err) = device.destroy_blob(blob) {
                warn!(parent: &self.span, "Failed to destroy mode blob: {}", err);
            }
        }
    }

    /// Whether frames currently reach the screen
    pub fn is_scanning_out(&self) -> bool {
        self.connected && self.power != PowerMode::Off
    }

    /// Stages a frame into a single atomic request
    ///
    /// Nothing is recorded on the display until [`DrmDisplay::committed`] is called.
    #[instrument(level = "trace", parent = &self.span, skip_all)]
    #[profiling::function]
    pub fn prepare(
        &self,
        device: &Arc<dyn KmsDevice>,
        cache: &mut BufferCache,
        frame: FrameRequest,
        ui_scale: UiScale,
        fence_timeout: Duration,
    ) -> Result<PreparedFrame, Error> {
        let crtc_id = self.pipeline.crtc.id;
        let crtc = ObjectRef::Crtc(crtc_id);
        let mode = self.active_mode().ok_or(Error::NoMode(crtc_id))?.clone();
        let config = self.active_config().ok_or(Error::NoMode(crtc_id))?;
        let config_size = (config.width.max(1), config.height.max(1));
        let mode_size = (mode.hdisplay as i32, mode.vdisplay as i32);

        let mut request = AtomicRequest::new();
        let mut flags = CommitFlags::NONBLOCK;
        let mut framebuffers = Vec::new();
        let mut planes = HashSet::new();
        let mut fences = Vec::new();
        let mut new_mode_blob = None;
        let mut new_hdr_blob = None;

        for overlay in frame.overlays {
            if !self.pipeline.overlays.iter().any(|plane| plane.id == overlay.plane) {
                return Err(Error::UnknownPlane(overlay.plane));
            }
            let fb = import(device, cache, &overlay.buffer)?;
            let object = ObjectRef::Plane(overlay.plane);
            request.set(object, "CRTC_ID", PropValue::Object(crtc_id.0));
            request.set(object, "FB_ID", PropValue::Object(fb.id().0));
            let dst = scale_rect(overlay.destination, config_size, mode_size);
            request.set_plane_geometry(overlay.plane, source_rect(overlay.source), dst);
            if let Some(fence) = overlay.fence {
                if self.plane_has_property(overlay.plane, "IN_FENCE_FD") {
                    request.set(object, "IN_FENCE_FD", PropValue::Signed(fence.as_raw_fd() as i64));
                } else {
                    wait_acquire(overlay.plane, &fence, fence_timeout);
                }
                fences.push(fence);
            }
            trace!(layer = %overlay.layer, plane = ?overlay.plane, fb = ?fb.id(), "Overlay staged");
            planes.insert(overlay.plane);
            framebuffers.push(fb);
        }

        let primary = &self.pipeline.primary;
        let primary_obj = ObjectRef::Plane(primary.id);
        match frame.primary {
            Some(content) => {
                let fb = import(device, cache, &content.buffer)?;
                let (w, h) = (content.buffer.width() as i32, content.buffer.height() as i32);
                let dst_size = match ui_scale {
                    UiScale::Hardware => mode_size,
                    UiScale::Software | UiScale::None => (w.min(mode_size.0), h.min(mode_size.1)),
                };
                request.set(primary_obj, "CRTC_ID", PropValue::Object(crtc_id.0));
                request.set(primary_obj, "FB_ID", PropValue::Object(fb.id().0));
                request.set_plane_geometry(
                    primary.id,
                    [0.0, 0.0, w as f64, h as f64],
                    [0, 0, align_even(dst_size.0), align_even(dst_size.1)],
                );
                if primary.has_property("IN_FENCE_FD") {
                    let raw = content.fence.as_ref().map(|f| f.as_raw_fd() as i64).unwrap_or(-1);
                    request.set(primary_obj, "IN_FENCE_FD", PropValue::Signed(raw));
                } else if let Some(fence) = &content.fence {
                    wait_acquire(primary.id, fence, fence_timeout);
                }
                fences.extend(content.fence);
                planes.insert(primary.id);
                framebuffers.push(fb);
            }
            None => request.disable_plane(primary.id),
        }

        for plane in self.active_planes.difference(&planes) {
            if *plane != primary.id {
                trace!(?plane, "Disabling plane unused this frame");
                request.disable_plane(*plane);
            }
        }

        if self.modeset_pending {
            let connector = &self.pipeline.connector;
            request.set(
                ObjectRef::Connector(connector.id),
                "CRTC_ID",
                PropValue::Object(crtc_id.0),
            );
            if connector.has_property("HDR_OUTPUT_METADATA") {
                let blob = match &self.hdr_metadata {
                    Some(metadata) => {
                        let blob = device.create_hdr_blob(&HdrOutputMetadata::from(metadata))?;
                        new_hdr_blob = Some(blob);
                        blob.0
                    }
                    None => 0,
                };
                request.set(
                    ObjectRef::Connector(connector.id),
                    "HDR_OUTPUT_METADATA",
                    PropValue::Blob(blob),
                );
            }
            let blob = match device.create_mode_blob(&mode) {
                Ok(blob) => blob,
                Err(err) => {
                    release_blob(device.as_ref(), new_hdr_blob);
                    return Err(err);
                }
            };
            new_mode_blob = Some(blob);
            request.set(crtc, "ACTIVE", PropValue::Unsigned(1));
            request.set(crtc, "MODE_ID", PropValue::Blob(blob.0));
            flags = CommitFlags::ALLOW_MODESET;
            debug!(mode = %mode.name, "Staging modeset");
        }

        if let Some(enabled) = self.content_protection {
            if self.pipeline.connector.has_property("Content Protection") {
                request.set(
                    ObjectRef::Connector(self.pipeline.connector.id),
                    "Content Protection",
                    PropValue::Unsigned(enabled as u64),
                );
            }
        }

        if self.pipeline.crtc.properties.contains("OUT_FENCE_PTR") {
            request.set(crtc, "OUT_FENCE_PTR", PropValue::OutFence);
        }

        Ok(PreparedFrame {
            request,
            flags,
            framebuffers,
            planes,
            new_mode_blob,
            new_hdr_blob,
            _fences: fences,
        })
    }

    /// Records the result of submitting a prepared frame
    ///
    /// On failure the display keeps describing what is actually on screen and
    /// the blobs created for the frame are destroyed.
    pub fn committed(&mut self, device: &dyn KmsDevice, frame: PreparedFrame, success: bool) {
        let _guard = self.span.enter();
        if !success {
            error!("Commit failed, frame dropped");
            release_blob(device, frame.new_mode_blob);
            release_blob(device, frame.new_hdr_blob);
            return;
        }

        if let Some(blob) = frame.new_mode_blob {
            release_blob(device, self.mode_blob.replace(blob));
            self.modeset_pending = false;
        }
        if frame.new_hdr_blob.is_some() || frame.new_mode_blob.is_some() {
            release_blob(device, std::mem::replace(&mut self.hdr_blob, frame.new_hdr_blob));
        }
        self.content_protection = None;
        self.active_planes = frame.planes;
        // the previous frame's framebuffers may only go once the new ones are latched
        self.on_screen = frame.framebuffers;
    }

    fn plane_has_property(&self, plane: PlaneId, name: &str) -> bool {
        self.pipeline
            .overlays
            .iter()
            .chain(std::iter::once(&self.pipeline.primary))
            .find(|info| info.id == plane)
            .map(|info| info.has_property(name))
            .unwrap_or(false)
    }

    pub fn release(&mut self, device: &dyn KmsDevice) {
        self.on_screen.clear();
        release_blob(device, self.mode_blob.take());
        release_blob(device, self.hdr_blob.take());
    }
}

/// Blocks on the acquire fence of a plane that cannot take it with the commit
fn wait_acquire(plane: PlaneId, fence: &Fence, timeout: Duration) {
    if let Err(err) = fence.wait(timeout) {
        warn!(?plane, ?err, "Acquire fence did not signal, scanning out anyway");
    }
}

fn release_blob(device: &dyn KmsDevice, blob: Option<BlobId>) {
    if let Some(blob) = blob {
        if let Err(err) = device.destroy_blob(blob) {
            warn!(?blob, "Failed to destroy property blob: {}", err);
        }
    }
}

/// Resolves the framebuffer of a client buffer, importing it on a cache miss
#[profiling::function]
pub(super) fn import(
    device: &Arc<dyn KmsDevice>,
    cache: &mut BufferCache,
    buffer: &ClientBuffer,
) -> Result<Arc<HardwareFramebuffer>, Error> {
    let gem = device.import_prime(buffer.fd())?;
    if let Some(fb) = cache.get(gem) {
        return Ok(fb);
    }
    let fb = Arc::new(HardwareFramebuffer::create(device, gem, buffer)?);
    cache.set(gem, fb.clone());
    Ok(fb)
}

/// Rounds down to an even value, at least 2
#[inline]
fn align_even(v: i32) -> i32 {
    (v & !1).max(2)
}

fn source_rect(src: Rectangle<f64, Buffer>) -> [f64; 4] {
    [
        src.loc.x,
        src.loc.y,
        align_even(src.size.w as i32) as f64,
        align_even(src.size.h as i32) as f64,
    ]
}

/// Maps a rectangle in config coordinates to mode coordinates
fn scale_rect(rect: Rectangle<i32, Display>, from: (i32, i32), to: (i32, i32)) -> [i32; 4] {
    let scale = |v: i32, a: i32, b: i32| ((v as i64 * b as i64) / a as i64) as i32;
    [
        scale(rect.loc.x, from.0, to.0),
        scale(rect.loc.y, from.1, to.1),
        align_even(scale(rect.size.w, from.0, to.0)),
        align_even(scale(rect.size.h, from.1, to.1)),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{
            allocator::{test::buffer, Fourcc},
            drm::{
                device::test::MockDevice,
                topology::{
                    test::{connector, crtc, mode, plane},
                    ConnectorId, CrtcId, PlaneKind, Topology,
                },
            },
            sync::test::{signal, unsignaled},
            PlaneCommit, PrimaryCommit,
        },
        composer::layer::LayerId,
        utils::{Point, Size},
    };
    use std::time::Instant;

    const FENCE_TIMEOUT: Duration = Duration::from_secs(5);

    fn pipeline() -> Pipeline {
        let topology = Topology {
            crtcs: vec![crtc(10, 0)],
            planes: vec![
                plane(20, PlaneKind::Primary, 1, &[(Fourcc::Xrgb8888, &[])]),
                plane(21, PlaneKind::Overlay, 1, &[(Fourcc::Nv12, &[])]),
                plane(22, PlaneKind::Overlay, 1, &[(Fourcc::Nv12, &[])]),
            ],
            connectors: vec![connector(30, 1, vec![mode(1920, 1080, 60, true)])],
        };
        topology.pipelines().remove(0)
    }

    fn connected_display() -> DrmDisplay {
        let pipeline = pipeline();
        let connector = pipeline.connector.clone();
        let mut display = DrmDisplay::new(0, pipeline, true);
        let mut next_id = 0;
        display.connect(connector, &mut next_id, None);
        display
    }

    fn primary_frame() -> FrameRequest {
        FrameRequest {
            overlays: Vec::new(),
            primary: Some(PrimaryCommit {
                buffer: Arc::new(buffer(1920, 1080, Fourcc::Xrgb8888)),
                fence: None,
            }),
        }
    }

    #[test]
    fn first_frame_performs_modeset() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(10);
        let mut display = connected_display();

        let frame = display.prepare(&device, &mut cache, primary_frame(), UiScale::None, FENCE_TIMEOUT).unwrap();
        assert!(frame.flags.contains(CommitFlags::ALLOW_MODESET));
        let req = &frame.request;
        let crtc = ObjectRef::Crtc(CrtcId(10));
        assert_eq!(req.get(crtc, "ACTIVE"), Some(PropValue::Unsigned(1)));
        assert!(matches!(req.get(crtc, "MODE_ID"), Some(PropValue::Blob(_))));
        assert_eq!(req.get(crtc, "OUT_FENCE_PTR"), Some(PropValue::OutFence));
        assert_eq!(
            req.get(ObjectRef::Connector(ConnectorId(30)), "CRTC_ID"),
            Some(PropValue::Object(10))
        );
        let primary = ObjectRef::Plane(PlaneId(20));
        assert_eq!(req.get(primary, "IN_FENCE_FD"), Some(PropValue::Signed(-1)));
        assert_eq!(req.get(primary, "CRTC_W"), Some(PropValue::Unsigned(1920)));

        display.committed(device.as_ref(), frame, true);
        let frame = display.prepare(&device, &mut cache, primary_frame(), UiScale::None, FENCE_TIMEOUT).unwrap();
        assert!(!frame.flags.contains(CommitFlags::ALLOW_MODESET));
        assert_eq!(frame.request.get(crtc, "MODE_ID"), None);
    }

    #[test]
    fn planes_unused_next_frame_are_disabled() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(10);
        let mut display = connected_display();

        let mut frame = primary_frame();
        frame.overlays.push(PlaneCommit {
            layer: LayerId::from_raw(1),
            plane: PlaneId(21),
            buffer: Arc::new(buffer(640, 480, Fourcc::Nv12)),
            source: Rectangle::from_size(Size::from((640.0, 480.0))),
            destination: Rectangle::new(Point::from((101, 51)), Size::from((641, 481))),
            fence: None,
        });
        let prepared = display.prepare(&device, &mut cache, frame, UiScale::None, FENCE_TIMEOUT).unwrap();
        let overlay = ObjectRef::Plane(PlaneId(21));
        assert_eq!(prepared.request.get(overlay, "CRTC_ID"), Some(PropValue::Object(10)));
        assert_eq!(prepared.request.get(overlay, "CRTC_X"), Some(PropValue::Signed(101)));
        assert_eq!(prepared.request.get(overlay, "CRTC_W"), Some(PropValue::Unsigned(640)));
        display.committed(device.as_ref(), prepared, true);

        let prepared = display.prepare(&device, &mut cache, primary_frame(), UiScale::None, FENCE_TIMEOUT).unwrap();
        assert_eq!(prepared.request.get(overlay, "CRTC_ID"), Some(PropValue::Object(0)));
        assert_eq!(prepared.request.get(overlay, "FB_ID"), Some(PropValue::Object(0)));
        assert_eq!(prepared.request.get(ObjectRef::Plane(PlaneId(22)), "FB_ID"), None);
    }

    fn overlay(plane: u32, buffer: &Arc<ClientBuffer>, fence: Option<Fence>) -> PlaneCommit {
        PlaneCommit {
            layer: LayerId::from_raw(plane as u64),
            plane: PlaneId(plane),
            buffer: buffer.clone(),
            source: Rectangle::from_size(Size::from((640.0, 480.0))),
            destination: Rectangle::from_size(Size::from((640, 480))),
            fence,
        }
    }

    #[test]
    fn overlay_without_fence_property_waits_for_acquire() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(10);
        let mut display = connected_display();
        for plane in &mut display.pipeline.overlays {
            plane.properties.remove("IN_FENCE_FD");
        }

        let fence = unsignaled();
        let signaler = fence.duplicate().unwrap();
        let delay = Duration::from_millis(30);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(delay);
            signal(&signaler);
        });

        let mut frame = primary_frame();
        let video = Arc::new(buffer(640, 480, Fourcc::Nv12));
        frame.overlays.push(overlay(21, &video, Some(fence)));
        let started = Instant::now();
        let prepared = display.prepare(&device, &mut cache, frame, UiScale::None, FENCE_TIMEOUT).unwrap();
        let elapsed = started.elapsed();
        thread.join().unwrap();

        assert!(elapsed >= delay, "returned after {:?}", elapsed);
        assert!(elapsed < FENCE_TIMEOUT);
        assert_eq!(prepared.request.get(ObjectRef::Plane(PlaneId(21)), "IN_FENCE_FD"), None);
        assert_eq!(prepared.request.get(ObjectRef::Plane(PlaneId(21)), "CRTC_ID"), Some(PropValue::Object(10)));
    }

    #[test]
    fn reimporting_an_evicted_buffer_on_screen_reuses_its_framebuffer() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(1);
        let mut display = connected_display();
        let first = Arc::new(buffer(640, 480, Fourcc::Nv12));
        let second = Arc::new(buffer(640, 480, Fourcc::Nv12));
        let first_gem = device.import_prime(first.fd()).unwrap();
        let second_gem = device.import_prime(second.fd()).unwrap();

        let mut frame = primary_frame();
        let primary = frame.primary.as_ref().unwrap().buffer.clone();
        frame.overlays.push(overlay(21, &first, None));
        frame.overlays.push(overlay(22, &second, None));
        let prepared = display.prepare(&device, &mut cache, frame, UiScale::None, FENCE_TIMEOUT).unwrap();
        let shown = prepared.framebuffers[0].clone();
        display.committed(device.as_ref(), prepared, true);

        let frame = FrameRequest {
            overlays: vec![overlay(21, &first, None)],
            primary: Some(PrimaryCommit {
                buffer: primary,
                fence: None,
            }),
        };
        let prepared = display.prepare(&device, &mut cache, frame, UiScale::None, FENCE_TIMEOUT).unwrap();
        assert!(Arc::ptr_eq(&shown, &prepared.framebuffers[0]));
        display.committed(device.as_ref(), prepared, true);
        drop(shown);

        assert_eq!(*mock.closed.lock().unwrap(), vec![second_gem]);
        assert!(!mock.closed.lock().unwrap().contains(&first_gem));
        assert_eq!(mock.live_framebuffers(), 2);
    }

    #[test]
    fn failed_commit_keeps_previous_state() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let mut cache = BufferCache::new(10);
        let mut display = connected_display();

        let frame = display.prepare(&device, &mut cache, primary_frame(), UiScale::None, FENCE_TIMEOUT).unwrap();
        let blob = match frame.request.get(ObjectRef::Crtc(CrtcId(10)), "MODE_ID") {
            Some(PropValue::Blob(id)) => BlobId(id),
            other => panic!("unexpected MODE_ID {:?}", other),
        };
        display.committed(device.as_ref(), frame, false);
        assert_eq!(*mock.destroyed_blobs.lock().unwrap(), vec![blob]);

        // the modeset is retried with the next frame
        let frame = display.prepare(&device, &mut cache, primary_frame(), UiScale::None, FENCE_TIMEOUT).unwrap();
        assert!(frame.flags.contains(CommitFlags::ALLOW_MODESET));
    }

    #[test]
    fn primary_disconnect_keeps_placeholder() {
        let mut display = connected_display();
        let active = display.active_config().cloned().unwrap();
        let mut next_id = 10;
        let connector = display.pipeline.connector.clone();
        display.disconnect(connector, &mut next_id);

        assert!(display.reported_connected());
        assert!(!display.is_scanning_out());
        assert_eq!(display.configs.len(), 1);
        let placeholder = &display.configs[0];
        assert_eq!(placeholder.id, 10);
        assert_eq!(placeholder.mode_id, 0);
        assert_eq!((placeholder.width, placeholder.height), (active.width, active.height));
        assert_eq!(display.active, Some(10));
        assert_eq!(next_id, 11);
    }

    #[test]
    fn secondary_disconnect_drops_configs() {
        let pipeline = pipeline();
        let connector = pipeline.connector.clone();
        let mut display = DrmDisplay::new(1, pipeline, false);
        let mut next_id = 0;
        display.connect(connector.clone(), &mut next_id, None);
        display.disconnect(connector, &mut next_id);
        assert!(!display.reported_connected());
        assert!(display.configs.is_empty());
        assert_eq!(display.active, None);
    }

    #[test]
    fn config_scaling_and_alignment() {
        let rect = Rectangle::new(Point::from((10, 10)), Size::from((101, 51)));
        assert_eq!(scale_rect(rect, (1280, 720), (1920, 1080)), [15, 15, 150, 76]);
        assert_eq!(align_even(1), 2);
        assert_eq!(align_even(7), 6);
    }
}
