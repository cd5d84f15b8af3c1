use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, warn};

use super::{
    cache::BufferCache,
    commit::CommitFlags,
    device::KmsDevice,
    display::DrmDisplay,
    topology::{PlaneInfo, Topology},
    Error,
};
use crate::{
    backend::{
        allocator::{format, Fourcc},
        backlight::Backlight,
        sync::Fence,
        Capabilities, ConnectionType, DeviceClient, DisplayConfigs, DisplayId, Error as BackendError,
        FrameRequest, HdrMetadata, HotplugEvent, HotplugHandler, PowerMode,
    },
    composer::{
        config::{ConfigId, EngineConfig, PreferredMode, UiScale},
        layer::{Composition, LayerState},
    },
    utils::unpoison,
};

/// Display ids of this driver start at this offset
const MXSFB_DISPLAY_BASE: DisplayId = 0x40;
const MXSFB_DRIVER: &str = "mxsfb-drm";

/// Largest up- or downscale an overlay plane performs
const MAX_OVERLAY_SCALE: f64 = 7.0;

#[derive(Debug)]
struct ClientState {
    displays: IndexMap<DisplayId, DrmDisplay>,
    cache: BufferCache,
    next_config_id: ConfigId,
}

/// [`DeviceClient`] driving a kernel mode-setting device through atomic commits
///
/// Every connector with a usable CRTC becomes a display; the first one is the
/// primary display. All displays share the device and the buffer cache, so
/// commits for different displays are serialized.
pub struct DrmClient {
    device: Arc<dyn KmsDevice>,
    state: Mutex<ClientState>,
    hotplug: Mutex<Option<HotplugHandler>>,
    backlight: Option<Backlight>,
    overlay_enabled: bool,
    ui_scale: UiScale,
    fence_timeout: Duration,
    preferred_mode: Option<PreferredMode>,
    span: tracing::Span,
}

impl std::fmt::Debug for DrmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmClient")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("backlight", &self.backlight)
            .field("overlay_enabled", &self.overlay_enabled)
            .finish_non_exhaustive()
    }
}

impl DrmClient {
    /// Opens the card node at `path`
    #[cfg(feature = "backend_drm")]
    pub fn open(path: impl AsRef<std::path::Path>, config: &EngineConfig) -> Result<DrmClient, Error> {
        let device = super::device::DrmDevice::open(path)?;
        DrmClient::new(Arc::new(device), config)
    }

    /// Enumerates the device and sets up one display per usable connector
    pub fn new(device: Arc<dyn KmsDevice>, config: &EngineConfig) -> Result<DrmClient, Error> {
        let driver = device.driver_name()?;
        let span = info_span!("drm_client", driver = %driver);
        let _guard = span.enter();

        let base = if driver == MXSFB_DRIVER { MXSFB_DISPLAY_BASE } else { 0 };
        let topology: Topology = device.topology()?;
        let pipelines = topology.pipelines();
        info!(
            crtcs = topology.crtcs.len(),
            planes = topology.planes.len(),
            displays = pipelines.len(),
            "Enumerated drm device"
        );

        let mut next_config_id = 0;
        let mut displays = IndexMap::new();
        for (index, pipeline) in pipelines.into_iter().enumerate() {
            let id = base + index as DisplayId;
            let connector = pipeline.connector.clone();
            let mut display = DrmDisplay::new(id, pipeline, index == 0);
            if connector.is_connected() {
                display.connect(connector, &mut next_config_id, config.preferred_mode.as_ref());
            } else {
                display.disconnect(connector, &mut next_config_id);
            }
            displays.insert(id, display);
        }

        let capacity = config.buffer_cache_per_display * displays.len().max(1);
        let backlight = match Backlight::open(&config.backlight_root, &config.backlight_device) {
            Ok(backlight) => backlight,
            Err(err) => {
                warn!("Failed to open backlight {}: {}", config.backlight_device, err);
                None
            }
        };

        drop(_guard);
        Ok(DrmClient {
            device,
            state: Mutex::new(ClientState {
                displays,
                cache: BufferCache::new(capacity),
                next_config_id,
            }),
            hotplug: Mutex::new(None),
            backlight,
            overlay_enabled: config.overlay_enabled,
            ui_scale: config.ui_scale,
            fence_timeout: config.fence_timeout(),
            preferred_mode: config.preferred_mode,
            span,
        })
    }

    fn with_display<T>(
        &self,
        display: DisplayId,
        f: impl FnOnce(&mut DrmDisplay) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut state = unpoison(self.state.lock());
        let display = state
            .displays
            .get_mut(&display)
            .ok_or(BackendError::UnknownDisplay(display))?;
        f(display)
    }

    fn power_off(&self, display: &mut DrmDisplay) -> Result<(), Error> {
        if display.connected {
            let request = display.power_off_request();
            self.device.commit(&request, CommitFlags::ALLOW_MODESET)?;
        }
        display.powered_off(self.device.as_ref());
        Ok(())
    }

    fn notify(&self, events: Vec<HotplugEvent>) {
        let handler = unpoison(self.hotplug.lock()).clone();
        if let Some(handler) = handler {
            for event in events {
                handler(event);
            }
        }
    }
}

impl DeviceClient for DrmClient {
    fn displays(&self) -> Vec<DisplayId> {
        unpoison(self.state.lock())
            .displays
            .values()
            .filter(|display| display.reported_connected())
            .map(|display| display.id)
            .collect()
    }

    fn primary_display(&self) -> Option<DisplayId> {
        unpoison(self.state.lock())
            .displays
            .values()
            .find(|display| display.primary)
            .map(|display| display.id)
    }

    fn is_connected(&self, display: DisplayId) -> Result<bool, BackendError> {
        self.with_display(display, |display| Ok(display.reported_connected()))
    }

    fn configs(&self, display: DisplayId) -> Result<DisplayConfigs, BackendError> {
        self.with_display(display, |display| Ok(display.display_configs()))
    }

    fn set_hotplug_handler(&self, handler: HotplugHandler) {
        *unpoison(self.hotplug.lock()) = Some(handler);
    }

    #[instrument(level = "debug", parent = &self.span, skip(self))]
    fn handle_hotplug(&self) -> Result<(), BackendError> {
        let mut events = Vec::new();
        {
            let mut guard = unpoison(self.state.lock());
            let state = &mut *guard;
            for display in state.displays.values_mut() {
                let connector = self.device.probe_connector(display.pipeline.connector.id)?;
                let now_connected = connector.is_connected();
                if now_connected == display.connected {
                    display.pipeline.connector = connector;
                    continue;
                }

                if now_connected {
                    display.connect(connector, &mut state.next_config_id, self.preferred_mode.as_ref());
                    display.power_on();
                } else {
                    display.disconnect(connector, &mut state.next_config_id);
                    // the pipeline lost its sink, the kernel already stopped scanning out
                    display.powered_off(self.device.as_ref());
                }
                events.push(HotplugEvent {
                    display: display.id,
                    connected: display.reported_connected(),
                    configs: display.display_configs(),
                });
            }
        }
        self.notify(events);
        Ok(())
    }

    fn overlay_supported(&self, display: DisplayId) -> bool {
        self.overlay_enabled
            && self
                .with_display(display, |display| Ok(!display.pipeline.overlays.is_empty()))
                .unwrap_or(false)
    }

    fn check_overlay_limitation(&self, _display: DisplayId, layer: &LayerState) -> bool {
        if !matches!(layer.composition, Composition::Device | Composition::Cursor) {
            return false;
        }
        if !layer.transform.is_empty() {
            return false;
        }
        let Some(buffer) = &layer.buffer else {
            return false;
        };
        if format::is_rgb(buffer.format()) {
            return false;
        }

        let src = layer.source_crop.size;
        let dst = layer.display_frame.size;
        if src.w <= 0.0 || src.h <= 0.0 || dst.w <= 0 || dst.h <= 0 {
            return false;
        }
        let scale = |a: f64, b: f64| if a > b { a / b } else { b / a };
        scale(src.w, dst.w as f64) <= MAX_OVERLAY_SCALE && scale(src.h, dst.h as f64) <= MAX_OVERLAY_SCALE
    }

    fn overlay_planes(&self, display: DisplayId) -> Result<Vec<PlaneInfo>, BackendError> {
        self.with_display(display, |display| Ok(display.pipeline.overlays.clone()))
    }

    fn primary_plane(&self, display: DisplayId) -> Option<PlaneInfo> {
        self.with_display(display, |display| Ok(display.pipeline.primary.clone()))
            .ok()
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, frame))]
    #[profiling::function]
    fn flush(&self, display_id: DisplayId, frame: FrameRequest) -> Result<Option<Fence>, BackendError> {
        let mut guard = unpoison(self.state.lock());
        let state = &mut *guard;
        let display = state
            .displays
            .get_mut(&display_id)
            .ok_or(BackendError::UnknownDisplay(display_id))?;
        if !display.is_scanning_out() {
            debug!("Display not scanning out, dropping frame");
            return Ok(None);
        }

        let prepared = display.prepare(&self.device, &mut state.cache, frame, self.ui_scale, self.fence_timeout)?;
        // transient failures are not retried, the caller presents again next vsync
        match self.device.commit(&prepared.request, prepared.flags) {
            Ok(out_fence) => {
                display.committed(self.device.as_ref(), prepared, true);
                Ok(out_fence.map(Fence::new))
            }
            Err(err) => {
                display.committed(self.device.as_ref(), prepared, false);
                Err(err.into())
            }
        }
    }

    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> Result<(), BackendError> {
        self.with_display(display, |display| {
            if display.set_active_config(config) {
                Ok(())
            } else {
                Err(BackendError::UnknownConfig(config))
            }
        })
    }

    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<(), BackendError> {
        self.with_display(display, |display| match mode {
            PowerMode::On => {
                display.power_on();
                Ok(())
            }
            PowerMode::Off => {
                if display.power != PowerMode::Off {
                    self.power_off(display)?;
                }
                Ok(())
            }
            PowerMode::Doze | PowerMode::DozeSuspend | PowerMode::OnSuspend => {
                Err(BackendError::Unsupported("power mode"))
            }
        })
    }

    fn set_secure_mode(&self, display: DisplayId, secure: bool) -> Result<(), BackendError> {
        self.with_display(display, |display| {
            if !display.pipeline.connector.has_property("Content Protection") {
                return Err(BackendError::Unsupported("content protection"));
            }
            display.set_content_protection(secure);
            Ok(())
        })
    }

    fn set_brightness(&self, display: DisplayId, brightness: f32) -> Result<(), BackendError> {
        let primary = self.with_display(display, |display| Ok(display.primary))?;
        match (&self.backlight, primary) {
            (Some(backlight), true) => backlight.set(brightness).map_err(|source| BackendError::Io {
                errmsg: "Failed to set backlight",
                source,
            }),
            _ => Err(BackendError::Unsupported("brightness")),
        }
    }

    fn set_hdr_metadata(&self, display: DisplayId, metadata: Option<&HdrMetadata>) -> Result<(), BackendError> {
        self.with_display(display, |display| {
            display.set_hdr_metadata(metadata.copied());
            Ok(())
        })
    }

    fn capabilities(&self, display: DisplayId) -> Capabilities {
        self.with_display(display, |display| {
            let mut caps = Capabilities::empty();
            if display.primary && self.backlight.is_some() {
                caps |= Capabilities::BRIGHTNESS;
            }
            if display.pipeline.connector.has_property("Content Protection") {
                caps |= Capabilities::PROTECTED_CONTENTS;
            }
            Ok(caps)
        })
        .unwrap_or_default()
    }

    fn connection_type(&self, display: DisplayId) -> Result<ConnectionType, BackendError> {
        self.with_display(display, |display| {
            Ok(if display.primary {
                ConnectionType::Internal
            } else {
                ConnectionType::External
            })
        })
    }

    fn edid(&self, display: DisplayId) -> Option<Vec<u8>> {
        self.with_display(display, |display| Ok(display.pipeline.connector.edid.clone()))
            .ok()
            .flatten()
    }

    fn wait_vblank(&self, display: DisplayId) -> Result<Duration, BackendError> {
        let crtc_index = self.with_display(display, |display| {
            if !display.is_scanning_out() {
                return Err(BackendError::Unsupported("vblank of an inactive display"));
            }
            Ok(display.pipeline.crtc.index)
        })?;
        // waiting must not hold the state lock
        Ok(self.device.wait_vblank(crtc_index)?)
    }

    fn target_format(&self, display: DisplayId) -> Fourcc {
        let primary = self.primary_plane(display);
        let supports = |format: Fourcc| {
            primary
                .as_ref()
                .map(|plane| plane.formats.contains_key(&format))
                .unwrap_or(false)
        };
        if supports(Fourcc::Abgr8888) {
            Fourcc::Abgr8888
        } else if supports(Fourcc::Xrgb8888) {
            Fourcc::Xrgb8888
        } else {
            Fourcc::Rgb565
        }
    }
}

impl Drop for DrmClient {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        let mut state = unpoison(self.state.lock());
        for display in state.displays.values_mut() {
            display.release(self.device.as_ref());
        }
        state.cache.clear();
        if !state.displays.is_empty() {
            debug!("Released display resources");
        }
    }
}
