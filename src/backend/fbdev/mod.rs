//! Legacy frame-buffer backend
//!
//! Drives a single display through `/dev/fbN`. The screen info of the device
//! yields exactly one config, frames are shown by panning the scan-out to the
//! physical address of the primary buffer and there are no overlay planes or
//! hotplug events.

mod ffi;

use std::{
    ffi::c_ulong,
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use tracing::{debug, info, info_span, instrument, warn};

use crate::{
    backend::{
        allocator::Fourcc,
        backlight::Backlight,
        sync::Fence,
        Capabilities, ConnectionType, DeviceClient, DisplayConfigs, DisplayId, Error as BackendError,
        FrameRequest, HdrMetadata, HotplugHandler, PlaneInfo, PowerMode,
    },
    composer::{
        config::{ConfigId, DisplayConfig, EngineConfig},
        layer::LayerState,
    },
    utils::{unpoison, DeviceFd, Monotonic, TimeSource},
};

/// Errors of the frame-buffer backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An ioctl on the device failed
    #[error("{errmsg} on {dev:?}: {source}")]
    Access {
        /// What was attempted
        errmsg: &'static str,
        /// Device node
        dev: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// The only display of a frame-buffer device
pub const FBDEV_DISPLAY: DisplayId = 0;

const FALLBACK_REFRESH: u32 = 60;
const FALLBACK_DPI: f32 = 160.0;

/// Refresh rate from the timings of the screen info, 60 Hz when the driver reports none
fn refresh_hz(info: &ffi::fb_var_screeninfo) -> u32 {
    let vtotal = u64::from(info.upper_margin + info.lower_margin + info.yres + info.vsync_len);
    let htotal = u64::from(info.left_margin + info.right_margin + info.xres + info.hsync_len);
    let period = vtotal * htotal * u64::from(info.pixclock);
    match 1_000_000_000_000u64.checked_div(period) {
        Some(0) | None => FALLBACK_REFRESH,
        Some(hz) => hz as u32,
    }
}

fn dpi(pixels: u32, mm: u32) -> f32 {
    // some drivers report -1
    if mm == 0 || mm == u32::MAX {
        return FALLBACK_DPI;
    }
    pixels as f32 * 25.4 / mm as f32
}

fn display_config(id: ConfigId, info: &ffi::fb_var_screeninfo) -> DisplayConfig {
    let mut config = DisplayConfig::new(
        id,
        info.xres as i32,
        info.yres as i32,
        refresh_hz(info),
        dpi(info.xres, info.width),
    );
    config.dpi_y = dpi(info.yres, info.height);
    config
}

fn pixel_format(info: &ffi::fb_var_screeninfo) -> Fourcc {
    match info.bits_per_pixel {
        32 if info.red.offset == 0 => Fourcc::Abgr8888,
        32 => Fourcc::Argb8888,
        _ => Fourcc::Rgb565,
    }
}

#[derive(Debug)]
struct FbState {
    config: DisplayConfig,
    format: Fourcc,
    power: PowerMode,
}

/// [`DeviceClient`] for a legacy frame-buffer device
#[derive(Debug)]
pub struct FbdevClient {
    fd: DeviceFd,
    path: PathBuf,
    state: Mutex<FbState>,
    backlight: Option<Backlight>,
    fence_timeout: Duration,
    span: tracing::Span,
}

impl FbdevClient {
    /// Opens the frame-buffer device at `path`
    pub fn open(path: impl AsRef<Path>, config: &EngineConfig) -> Result<FbdevClient, Error> {
        let path = path.as_ref().to_path_buf();
        let span = info_span!("fbdev", device = ?path);
        let _guard = span.enter();

        let fd = DeviceFd::open(&path).map_err(|source| Error::Access {
            errmsg: "Failed to open device",
            dev: path.clone(),
            source,
        })?;
        let mut client = FbdevClient {
            fd,
            path,
            state: Mutex::new(FbState {
                config: DisplayConfig::new(0, 0, 0, FALLBACK_REFRESH, FALLBACK_DPI),
                format: Fourcc::Rgb565,
                power: PowerMode::On,
            }),
            backlight: Backlight::open(&config.backlight_root, &config.backlight_device).unwrap_or_else(|err| {
                warn!("Failed to open backlight {}: {}", config.backlight_device, err);
                None
            }),
            fence_timeout: config.fence_timeout(),
            span: span.clone(),
        };

        let info = client.var_screeninfo()?;
        let fix = client.fix_screeninfo()?;
        let state = client.state.get_mut().unwrap_or_else(|err| err.into_inner());
        state.config = display_config(0, &info);
        state.format = pixel_format(&info);
        info!(
            width = info.xres,
            height = info.yres,
            bpp = info.bits_per_pixel,
            refresh = state.config.refresh_hz(),
            line_length = fix.line_length,
            "Opened frame-buffer device"
        );
        drop(_guard);
        Ok(client)
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> Error + '_ {
        move |source| Error::Access {
            errmsg,
            dev: self.path.clone(),
            source,
        }
    }

    fn ioctl<T>(&self, request: c_ulong, arg: *mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn var_screeninfo(&self) -> Result<ffi::fb_var_screeninfo, Error> {
        let mut info = ffi::fb_var_screeninfo::default();
        self.ioctl(ffi::FBIOGET_VSCREENINFO, &mut info)
            .map_err(self.access("Failed to get variable screen info"))?;
        Ok(info)
    }

    fn fix_screeninfo(&self) -> Result<ffi::fb_fix_screeninfo, Error> {
        let mut info = ffi::fb_fix_screeninfo::default();
        self.ioctl(ffi::FBIOGET_FSCREENINFO, &mut info)
            .map_err(self.access("Failed to get fixed screen info"))?;
        Ok(info)
    }

    fn blank(&self, mode: c_ulong) -> Result<(), Error> {
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), ffi::FBIOBLANK as _, mode) };
        if ret < 0 {
            return Err(self.access("Failed to change blanking")(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn check(&self, display: DisplayId) -> Result<(), BackendError> {
        if display == FBDEV_DISPLAY {
            Ok(())
        } else {
            Err(BackendError::UnknownDisplay(display))
        }
    }
}

impl DeviceClient for FbdevClient {
    fn displays(&self) -> Vec<DisplayId> {
        vec![FBDEV_DISPLAY]
    }

    fn primary_display(&self) -> Option<DisplayId> {
        Some(FBDEV_DISPLAY)
    }

    fn is_connected(&self, display: DisplayId) -> Result<bool, BackendError> {
        self.check(display).map(|_| true)
    }

    fn configs(&self, display: DisplayId) -> Result<DisplayConfigs, BackendError> {
        self.check(display)?;
        let state = unpoison(self.state.lock());
        Ok(DisplayConfigs {
            configs: vec![state.config.clone()],
            active: Some(state.config.id),
        })
    }

    fn set_hotplug_handler(&self, _handler: HotplugHandler) {}

    fn handle_hotplug(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn overlay_supported(&self, _display: DisplayId) -> bool {
        false
    }

    fn check_overlay_limitation(&self, _display: DisplayId, _layer: &LayerState) -> bool {
        false
    }

    fn overlay_planes(&self, display: DisplayId) -> Result<Vec<PlaneInfo>, BackendError> {
        self.check(display).map(|_| Vec::new())
    }

    fn primary_plane(&self, _display: DisplayId) -> Option<PlaneInfo> {
        None
    }

    #[instrument(level = "trace", parent = &self.span, skip(self, frame))]
    #[profiling::function]
    fn flush(&self, display_id: DisplayId, frame: FrameRequest) -> Result<Option<Fence>, BackendError> {
        self.check(display_id)?;
        if !frame.overlays.is_empty() {
            warn!(count = frame.overlays.len(), "Frame-buffer device has no overlays, dropping them");
        }
        let Some(primary) = frame.primary else {
            return Ok(None);
        };
        if unpoison(self.state.lock()).power == PowerMode::Off {
            debug!("Display off, dropping frame");
            return Ok(None);
        }

        if let Some(fence) = &primary.fence {
            if let Err(err) = fence.wait(self.fence_timeout) {
                warn!(?err, "Acquire fence of the client target did not signal");
            }
        }

        let addr = primary.buffer.physical_address();
        if addr == 0 {
            return Err(BackendError::Unsupported("buffer without physical address"));
        }
        let mut info = self.var_screeninfo()?;
        info.xoffset = 0;
        info.yoffset = 0;
        info.reserved[0] = addr as u32;
        info.reserved[1] = (addr >> 32) as u32;
        info.activate = ffi::FB_ACTIVATE_VBL;
        self.ioctl(ffi::FBIOPAN_DISPLAY, &mut info)
            .map_err(self.access("Failed to pan display"))?;
        Ok(None)
    }

    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> Result<(), BackendError> {
        self.check(display)?;
        if unpoison(self.state.lock()).config.id == config {
            Ok(())
        } else {
            Err(BackendError::UnknownConfig(config))
        }
    }

    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<(), BackendError> {
        self.check(display)?;
        let blank = match mode {
            PowerMode::On => ffi::FB_BLANK_UNBLANK,
            PowerMode::Off => ffi::FB_BLANK_POWERDOWN,
            _ => return Err(BackendError::Unsupported("power mode")),
        };
        self.blank(blank)?;
        unpoison(self.state.lock()).power = mode;
        Ok(())
    }

    fn set_secure_mode(&self, _display: DisplayId, _secure: bool) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("content protection"))
    }

    fn set_brightness(&self, display: DisplayId, brightness: f32) -> Result<(), BackendError> {
        self.check(display)?;
        let Some(backlight) = &self.backlight else {
            return Err(BackendError::Unsupported("brightness"));
        };
        backlight.set(brightness).map_err(|source| BackendError::Io {
            errmsg: "Failed to set backlight",
            source,
        })
    }

    fn set_hdr_metadata(&self, _display: DisplayId, _metadata: Option<&HdrMetadata>) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("hdr metadata"))
    }

    fn capabilities(&self, _display: DisplayId) -> Capabilities {
        if self.backlight.is_some() {
            Capabilities::BRIGHTNESS
        } else {
            Capabilities::empty()
        }
    }

    fn connection_type(&self, display: DisplayId) -> Result<ConnectionType, BackendError> {
        self.check(display).map(|_| ConnectionType::Internal)
    }

    fn edid(&self, _display: DisplayId) -> Option<Vec<u8>> {
        None
    }

    fn wait_vblank(&self, display: DisplayId) -> Result<Duration, BackendError> {
        self.check(display)?;
        let mut crtc: u32 = 0;
        self.ioctl(ffi::FBIO_WAITFORVSYNC, &mut crtc)
            .map_err(self.access("Failed to wait for vsync"))?;
        Ok(Monotonic.now())
    }

    fn target_format(&self, _display: DisplayId) -> Fourcc {
        unpoison(self.state.lock()).format
    }
}
