//! Hardware backends
//!
//! A [`DeviceClient`] is the capability contract between the composition
//! engine and one family of display hardware:
//!
//! - [`drm::DrmClient`] drives kernel mode-setting devices through atomic commits
//! - [`fbdev::FbdevClient`] drives legacy frame-buffer devices
//!
//! The 2D blit engine used to pre-blend layers lives in [`blit`].

pub mod allocator;
pub mod backlight;
pub mod blit;
pub mod drm;
#[cfg(feature = "backend_fbdev")]
pub mod fbdev;
pub mod sync;
#[cfg(feature = "backend_udev")]
pub mod udev;

use std::{fmt, io, sync::Arc, time::Duration};

use crate::{
    composer::{
        config::{ConfigId, DisplayConfig},
        layer::{LayerId, LayerState},
    },
    utils::{Buffer, Display, Rectangle},
};

use self::{allocator::ClientBuffer, sync::Fence};

pub use self::drm::topology::{PlaneId, PlaneInfo, PlaneKind};

/// Identifier of a display, stable for the lifetime of the device client
pub type DisplayId = u32;

/// Errors of the hardware backends
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The display is not driven by this client
    #[error("Unknown display {0}")]
    UnknownDisplay(DisplayId),
    /// The config does not belong to the display
    #[error("Unknown config {0}")]
    UnknownConfig(ConfigId),
    /// The hardware does not offer the capability
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
    /// Kernel mode-setting failure
    #[error(transparent)]
    Drm(#[from] self::drm::Error),
    /// Frame-buffer device failure
    #[cfg(feature = "backend_fbdev")]
    #[error(transparent)]
    Fbdev(#[from] self::fbdev::Error),
    /// Blit engine failure
    #[error(transparent)]
    Blit(#[from] self::blit::Error),
    /// Generic I/O failure outside of a device ioctl
    #[error("{errmsg}: {source}")]
    Io {
        /// What was attempted
        errmsg: &'static str,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Display power states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Screen off
    Off,
    /// Low power ambient mode
    Doze,
    /// Screen on
    On,
    /// Ambient mode without CPU updates
    DozeSuspend,
    /// Screen on without CPU updates
    OnSuspend,
}

/// Physical connection of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Built-in panel
    Internal,
    /// Pluggable output
    External,
}

bitflags::bitflags! {
    /// Optional capabilities of a display
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// The device applies the color transform itself
        const SKIP_CLIENT_COLOR_TRANSFORM = 1 << 0;
        /// Backlight can be controlled
        const BRIGHTNESS = 1 << 1;
        /// Protected content can reach the screen
        const PROTECTED_CONTENTS = 1 << 2;
    }
}

/// Keys of per-frame HDR metadata
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerFrameMetadataKey {
    DisplayRedPrimaryX,
    DisplayRedPrimaryY,
    DisplayGreenPrimaryX,
    DisplayGreenPrimaryY,
    DisplayBluePrimaryX,
    DisplayBluePrimaryY,
    WhitePointX,
    WhitePointY,
    MaxLuminance,
    MinLuminance,
    MaxContentLightLevel,
    MaxFrameAverageLightLevel,
}

/// Static HDR metadata (SMPTE ST 2086 plus CTA-861.3 light levels)
///
/// Chromaticities are CIE 1931 xy coordinates, luminances are in cd/m².
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HdrMetadata {
    pub red: (f32, f32),
    pub green: (f32, f32),
    pub blue: (f32, f32),
    pub white_point: (f32, f32),
    pub max_luminance: f32,
    pub min_luminance: f32,
    pub max_content_light_level: f32,
    pub max_frame_average_light_level: f32,
}

impl HdrMetadata {
    /// Update a single value
    pub fn set(&mut self, key: PerFrameMetadataKey, value: f32) {
        use PerFrameMetadataKey::*;
        match key {
            DisplayRedPrimaryX => self.red.0 = value,
            DisplayRedPrimaryY => self.red.1 = value,
            DisplayGreenPrimaryX => self.green.0 = value,
            DisplayGreenPrimaryY => self.green.1 = value,
            DisplayBluePrimaryX => self.blue.0 = value,
            DisplayBluePrimaryY => self.blue.1 = value,
            WhitePointX => self.white_point.0 = value,
            WhitePointY => self.white_point.1 = value,
            MaxLuminance => self.max_luminance = value,
            MinLuminance => self.min_luminance = value,
            MaxContentLightLevel => self.max_content_light_level = value,
            MaxFrameAverageLightLevel => self.max_frame_average_light_level = value,
        }
    }
}

/// Config set of a display as reported by its client
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayConfigs {
    /// All admissible configs
    pub configs: Vec<DisplayConfig>,
    /// The config currently programmed
    pub active: Option<ConfigId>,
}

/// Connection change of a display
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    /// Affected display
    pub display: DisplayId,
    /// New connection state, as it should be reported to clients
    pub connected: bool,
    /// Config set after the change
    pub configs: DisplayConfigs,
}

/// Receiver of [`HotplugEvent`]s
pub type HotplugHandler = Arc<dyn Fn(HotplugEvent) + Send + Sync>;

/// One layer scanned out directly by an overlay plane
#[derive(Debug)]
pub struct PlaneCommit {
    /// Layer shown on the plane
    pub layer: LayerId,
    /// Plane claimed during validation
    pub plane: PlaneId,
    /// Buffer to scan out
    pub buffer: Arc<ClientBuffer>,
    /// Region of the buffer
    pub source: Rectangle<f64, Buffer>,
    /// Region of the display, in config coordinates
    pub destination: Rectangle<i32, Display>,
    /// Signals when the buffer may be read
    pub fence: Option<Fence>,
}

/// Content of the primary plane
#[derive(Debug)]
pub struct PrimaryCommit {
    /// Client target, blit target or passthrough buffer
    pub buffer: Arc<ClientBuffer>,
    /// Signals when the buffer may be read
    pub fence: Option<Fence>,
}

/// Everything a display shows in one frame
#[derive(Debug, Default)]
pub struct FrameRequest {
    /// Overlay planes, in ascending z-order
    pub overlays: Vec<PlaneCommit>,
    /// Primary plane content, `None` to leave the primary plane empty
    pub primary: Option<PrimaryCommit>,
}

/// Capability contract of a display hardware family
pub trait DeviceClient: Send + Sync + fmt::Debug {
    /// Displays driven by this client, primary first
    fn displays(&self) -> Vec<DisplayId>;

    /// The display that must never disappear
    fn primary_display(&self) -> Option<DisplayId>;

    /// Connection state as reported to clients
    fn is_connected(&self, display: DisplayId) -> Result<bool, Error>;

    /// Current config set of a display
    fn configs(&self, display: DisplayId) -> Result<DisplayConfigs, Error>;

    /// Install the receiver of connection changes
    fn set_hotplug_handler(&self, handler: HotplugHandler);

    /// Re-probe connectors after a hardware change notification
    fn handle_hotplug(&self) -> Result<(), Error>;

    /// Whether layers of this display may go to overlay planes at all
    fn overlay_supported(&self, display: DisplayId) -> bool;

    /// Whether the hardware can scan out this particular layer on an overlay
    fn check_overlay_limitation(&self, display: DisplayId, layer: &LayerState) -> bool;

    /// Overlay planes usable by the display this frame, lowest z first
    fn overlay_planes(&self, display: DisplayId) -> Result<Vec<PlaneInfo>, Error>;

    /// The plane showing the client target, if it can take arbitrary buffers
    fn primary_plane(&self, display: DisplayId) -> Option<PlaneInfo>;

    /// Show a frame, returning the fence that signals once it is on screen
    fn flush(&self, display: DisplayId, frame: FrameRequest) -> Result<Option<Fence>, Error>;

    /// Program a new mode with the next flush
    fn set_active_config(&self, display: DisplayId, config: ConfigId) -> Result<(), Error>;

    /// Change the power state
    fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<(), Error>;

    /// Enable or disable link protection
    fn set_secure_mode(&self, display: DisplayId, secure: bool) -> Result<(), Error>;

    /// Set the backlight level, `0.0..=1.0`
    fn set_brightness(&self, display: DisplayId, brightness: f32) -> Result<(), Error>;

    /// Forward static HDR metadata to the sink
    fn set_hdr_metadata(&self, display: DisplayId, metadata: Option<&HdrMetadata>) -> Result<(), Error>;

    /// Optional capabilities of a display
    fn capabilities(&self, display: DisplayId) -> Capabilities;

    /// Physical connection of a display
    fn connection_type(&self, display: DisplayId) -> Result<ConnectionType, Error>;

    /// Raw identification data of the sink, if the hardware exposes it
    fn edid(&self, display: DisplayId) -> Option<Vec<u8>>;

    /// Block until the next vertical blank, returning its timestamp
    fn wait_vblank(&self, display: DisplayId) -> Result<Duration, Error>;

    /// Pixel format for client and blit targets
    fn target_format(&self, display: DisplayId) -> allocator::Fourcc;
}
