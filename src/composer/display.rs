use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

use crate::{
    backend::{
        self,
        allocator::ClientBuffer,
        blit::{BlitComposer, TargetSpec},
        sync::{Fence, FenceError},
        Capabilities, ConnectionType, DeviceClient, DisplayConfigs, FrameRequest, HdrMetadata, PlaneCommit,
        PowerMode, PrimaryCommit,
    },
    utils::{unpoison, TimeSource},
};

use super::{
    config::{ConfigId, DisplayConfig, EngineConfig},
    layer::{z_order, Composition, Layer, LayerId, LayerState},
    store::Store,
    strategy::{allocate, Plan, PlaneModel, Strategy},
    vsync::{VblankSource, VsyncHandler, VsyncScheduler, VsyncTimeline},
    CallbackSlot, DisplayId, Error,
};

/// Identification data reported when the sink provides none
///
/// EDID 1.3, vendor "NXP", monitor name "NXP Android", no timings.
pub const LEGACY_EDID: [u8; 128] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x3B, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x1D,
    0x01, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01,
    0x64, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0xFC, 0x00, 0x4E, 0x58, 0x50, 0x20, 0x41, 0x6E, 0x64, 0x72, 0x6F, 0x69, 0x64, 0x0A, 0x0A,
    0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x1E,
];

/// Position of a display in the validate, accept, present cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentState {
    /// The next call must be [`Display::validate`]
    WaitingForValidate,
    /// Validation proposed changes the client has to accept
    WaitingForAccept,
    /// The frame may be presented
    WaitingForPresent,
}

/// Attributes of a [`DisplayConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayAttribute {
    /// Width in pixels
    Width,
    /// Height in pixels
    Height,
    /// Refresh period in nanoseconds
    VsyncPeriod,
    /// Horizontal dots per inch
    DpiX,
    /// Vertical dots per inch
    DpiY,
    /// Group of seamlessly switchable configs
    ConfigGroup,
}

/// Color modes a client may request
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    Native,
    StandardBt601_625,
    StandardBt601_525,
    StandardBt709,
    Srgb,
    DisplayP3,
    Bt2020,
    Bt2100Pq,
}

/// Gamut mapping of a color mode
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderIntent {
    Colorimetric,
    Enhance,
    ToneMapColorimetric,
    ToneMapEnhance,
}

/// Kind of content shown, used by sinks to pick a picture mode
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    None,
    Graphics,
    Photo,
    Cinema,
    Game,
}

/// Conditions of a config change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigChangeConstraints {
    /// Earliest time the change may become visible, `None` for right away
    pub desired_time: Option<Duration>,
    /// The change must not cause a visible glitch
    pub seamless_required: bool,
}

/// Fences handed out by [`Display::present`]
#[derive(Debug, Default)]
pub struct PresentFences {
    /// Signals once the frame is on screen
    pub display: Option<Fence>,
    /// Signals once the layer's buffer is no longer read, for every layer the
    /// hardware scanned out directly; `None` if the buffer is free right away
    pub layers: Vec<(LayerId, Option<Fence>)>,
}

#[derive(Debug)]
struct DisplayState {
    present_state: PresentState,
    configs: BTreeMap<ConfigId, DisplayConfig>,
    active_config: Option<ConfigId>,
    connected: bool,
    layers: HashMap<LayerId, Layer>,
    plan: Option<Plan>,
    pending_changes: Vec<(LayerId, Composition)>,
    client_target: Option<Arc<ClientBuffer>>,
    client_target_fence: Option<Fence>,
    last_fence: Option<Fence>,
    last_device_layers: Vec<LayerId>,
    color_mode: ColorMode,
    color_transform: Option<[f32; 16]>,
    power_mode: PowerMode,
    secure: bool,
    hdr_metadata: Option<HdrMetadata>,
    edid: Vec<u8>,
}

impl DisplayState {
    fn active(&self) -> Result<&DisplayConfig, Error> {
        self.active_config
            .and_then(|id| self.configs.get(&id))
            .ok_or(Error::BadConfig(self.active_config))
    }

    fn set_configs(&mut self, configs: DisplayConfigs) {
        self.configs = configs.configs.into_iter().map(|c| (c.id, c)).collect();
        self.active_config = configs.active;
    }
}

/// One output of the engine
///
/// All entry points lock the display for their whole duration, so calls on
/// one display are serialized while different displays proceed in parallel.
pub struct Display {
    id: DisplayId,
    client: Arc<dyn DeviceClient>,
    blit: Option<Arc<BlitComposer>>,
    store: Arc<Store>,
    callbacks: CallbackSlot,
    fence_timeout: Duration,
    vsync: OnceCell<VsyncScheduler>,
    state: Mutex<DisplayState>,
    span: tracing::Span,
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("id", &self.id)
            .field("blit", &self.blit.is_some())
            .field("state", &self.state)
            .field("vsync", &self.vsync)
            .finish_non_exhaustive()
    }
}

struct VsyncEvents {
    display: Weak<Display>,
    callbacks: CallbackSlot,
}

impl VsyncHandler for VsyncEvents {
    fn vsync(&self, display: DisplayId, timestamp: Duration, period: Duration) {
        if let Some(callback) = self.callbacks.get() {
            callback.on_vsync(display, timestamp, period);
        }
    }

    fn config_applied(&self, display: DisplayId, config: ConfigId) {
        if let Some(this) = self.display.upgrade() {
            this.take_effect_config(config);
        }
        if let Some(callback) = self.callbacks.get() {
            callback.on_refresh(display);
        }
    }
}

fn store_error(errmsg: &'static str) -> impl FnOnce(super::store::Error) -> Error {
    move |err| {
        error!(?err, "{}", errmsg);
        Error::NoResources { errmsg, source: None }
    }
}

fn is_identity(matrix: &[f32; 16]) -> bool {
    matrix
        .iter()
        .enumerate()
        .all(|(i, v)| *v == if i % 5 == 0 { 1.0 } else { 0.0 })
}

/// Copies `fence` once for every layer, or hands out the no-fence sentinel
fn share_fence(fence: Option<&Fence>, layers: &[LayerId]) -> Vec<(LayerId, Option<Fence>)> {
    let copies = match fence {
        Some(fence) if !layers.is_empty() => match fence.duplicate_n(layers.len()) {
            Ok(copies) => Some(copies),
            Err(err) => {
                warn!(?err, "Failed to duplicate release fence");
                None
            }
        },
        _ => None,
    };
    match copies {
        Some(copies) => layers.iter().copied().zip(copies.into_iter().map(Some)).collect(),
        None => layers.iter().map(|id| (*id, None)).collect(),
    }
}

fn wait_fence(fence: Option<Fence>, timeout: Duration, what: &str) {
    if let Some(fence) = fence {
        match fence.wait(timeout) {
            Ok(()) => {}
            Err(FenceError::Timeout(_)) => {
                error!("Waited {} ms on {} fence, using the buffer anyway", timeout.as_millis(), what)
            }
            Err(err) => warn!(?err, "Failed to wait on {} fence", what),
        }
    }
}

impl Display {
    pub(crate) fn new(
        id: DisplayId,
        client: Arc<dyn DeviceClient>,
        blit: Option<Arc<BlitComposer>>,
        store: Arc<Store>,
        callbacks: CallbackSlot,
        clock: Arc<dyn TimeSource>,
        settings: &EngineConfig,
    ) -> Result<Arc<Display>, Error> {
        let span = info_span!("display", display = id);
        let _guard = span.enter();

        let mut state = DisplayState {
            present_state: PresentState::WaitingForValidate,
            configs: BTreeMap::new(),
            active_config: None,
            connected: client.is_connected(id)?,
            layers: HashMap::new(),
            plan: None,
            pending_changes: Vec::new(),
            client_target: None,
            client_target_fence: None,
            last_fence: None,
            last_device_layers: Vec::new(),
            color_mode: ColorMode::Native,
            color_transform: None,
            power_mode: PowerMode::On,
            secure: false,
            hdr_metadata: None,
            edid: client.edid(id).unwrap_or_else(|| LEGACY_EDID.to_vec()),
        };
        state.set_configs(client.configs(id)?);

        let boot = store
            .get(&id.to_string(), "")
            .map_err(store_error("Failed to read boot config"))?
            .parse::<ConfigId>()
            .ok()
            .filter(|config| state.configs.contains_key(config));
        if let Some(boot) = boot {
            if state.active_config != Some(boot) {
                client.set_active_config(id, boot)?;
                state.active_config = Some(boot);
            }
        }

        let period = match state.active() {
            Ok(config) => {
                info!(
                    config = config.id,
                    "{}x{}@{}", config.width, config.height, config.refresh_hz()
                );
                config.vsync_period
            }
            Err(_) => {
                error!("Display has no active config");
                return Err(Error::NoResources {
                    errmsg: "Display has no active config",
                    source: None,
                });
            }
        };
        drop(_guard);

        let display = Arc::new(Display {
            id,
            client: client.clone(),
            blit,
            store,
            callbacks: callbacks.clone(),
            fence_timeout: settings.fence_timeout(),
            vsync: OnceCell::new(),
            state: Mutex::new(state),
            span,
        });

        let vblank = settings.hardware_vsync.then(|| {
            let client = client.clone();
            Box::new(move || client.wait_vblank(id)) as VblankSource
        });
        let events = Arc::new(VsyncEvents {
            display: Arc::downgrade(&display),
            callbacks,
        });
        let scheduler = VsyncScheduler::spawn(id, period, clock, vblank, events).map_err(|source| Error::NoResources {
            errmsg: "Failed to start vsync thread",
            source: Some(backend::Error::Io {
                errmsg: "Failed to spawn thread",
                source,
            }),
        })?;
        let _ = display.vsync.set(scheduler);

        Ok(display)
    }

    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        unpoison(self.state.lock())
    }

    /// Identifier of the display
    #[inline]
    pub fn id(&self) -> DisplayId {
        self.id
    }

    /// Where the display is in the present cycle
    pub fn present_state(&self) -> PresentState {
        self.lock().present_state
    }

    /// Create a new layer
    pub fn create_layer(&self) -> LayerId {
        let layer = Layer::new();
        let id = layer.id();
        self.lock().layers.insert(id, layer);
        let _guard = self.span.enter();
        debug!(layer = %id, "Created layer");
        id
    }

    /// Destroy a layer
    pub fn destroy_layer(&self, layer: LayerId) -> Result<(), Error> {
        self.lock().layers.remove(&layer).ok_or(Error::BadLayer(layer))?;
        let _guard = self.span.enter();
        debug!(%layer, "Destroyed layer");
        Ok(())
    }

    /// Modify a layer
    pub fn with_layer<T>(&self, layer: LayerId, f: impl FnOnce(&mut Layer) -> T) -> Result<T, Error> {
        let mut state = self.lock();
        let layer = state.layers.get_mut(&layer).ok_or(Error::BadLayer(layer))?;
        Ok(f(layer))
    }

    /// Snapshot of a layer
    pub fn layer_state(&self, layer: LayerId) -> Result<LayerState, Error> {
        self.with_layer(layer, |layer| layer.state().clone())
    }

    /// Currently shown config
    pub fn active_config(&self) -> Result<ConfigId, Error> {
        let state = self.lock();
        state.active_config.ok_or(Error::BadConfig(None))
    }

    /// All admissible configs, ordered by id
    pub fn configs(&self) -> Vec<ConfigId> {
        self.lock().configs.keys().copied().collect()
    }

    /// Full description of a config
    pub fn config(&self, config: ConfigId) -> Result<DisplayConfig, Error> {
        self.lock()
            .configs
            .get(&config)
            .cloned()
            .ok_or(Error::BadConfig(Some(config)))
    }

    /// A single attribute of a config
    pub fn attribute(&self, config: ConfigId, attribute: DisplayAttribute) -> Result<i32, Error> {
        let config = self.config(config)?;
        Ok(match attribute {
            DisplayAttribute::Width => config.width,
            DisplayAttribute::Height => config.height,
            DisplayAttribute::VsyncPeriod => config.vsync_period.as_nanos().min(i32::MAX as u128) as i32,
            DisplayAttribute::DpiX => config.dpi_x.round() as i32,
            DisplayAttribute::DpiY => config.dpi_y.round() as i32,
            DisplayAttribute::ConfigGroup => config.config_group,
        })
    }

    /// Refresh period of the active config
    pub fn vsync_period(&self) -> Result<Duration, Error> {
        Ok(self.lock().active()?.vsync_period)
    }

    /// Human readable name
    pub fn name(&self) -> String {
        format!("display_{}", self.id)
    }

    /// Physical connection of the display
    pub fn connection_type(&self) -> Result<ConnectionType, Error> {
        Ok(self.client.connection_type(self.id)?)
    }

    /// Whether a sink is attached, a primary display always reports connected
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Optional capabilities
    pub fn capabilities(&self) -> Capabilities {
        self.client.capabilities(self.id)
    }

    /// Port and EDID of the sink
    ///
    /// The port is the display id; ids outside the port range report port 255.
    pub fn identification_data(&self) -> (u8, Vec<u8>) {
        (port(self.id), self.lock().edid.clone())
    }

    /// Supported color modes
    pub fn color_modes(&self) -> Vec<ColorMode> {
        vec![ColorMode::Native]
    }

    /// Render intents of a color mode
    pub fn render_intents(&self, _mode: ColorMode) -> Vec<RenderIntent> {
        vec![RenderIntent::Colorimetric]
    }

    /// Select a color mode
    pub fn set_color_mode(&self, mode: ColorMode, intent: RenderIntent) -> Result<(), Error> {
        if !self.color_modes().contains(&mode) || !self.render_intents(mode).contains(&intent) {
            return Err(Error::Unsupported("color mode"));
        }
        self.lock().color_mode = mode;
        Ok(())
    }

    /// Active color mode
    pub fn color_mode(&self) -> ColorMode {
        self.lock().color_mode
    }

    /// Set a 4x4 column-major color matrix, applied by client composition
    pub fn set_color_transform(&self, matrix: &[f32]) -> Result<(), Error> {
        let matrix: [f32; 16] = matrix
            .get(..16)
            .and_then(|m| m.try_into().ok())
            .ok_or(Error::BadParameter("color transform must be a 4x4 matrix"))?;
        self.lock().color_transform = (!is_identity(&matrix)).then_some(matrix);
        Ok(())
    }

    /// Content types with a special picture mode
    pub fn supported_content_types(&self) -> Vec<ContentType> {
        Vec::new()
    }

    /// Announce the kind of content shown
    pub fn set_content_type(&self, content: ContentType) -> Result<(), Error> {
        match content {
            ContentType::None => Ok(()),
            _ => Err(Error::Unsupported("content type")),
        }
    }

    /// Set the backlight level, `0.0..=1.0`
    pub fn set_brightness(&self, brightness: f32) -> Result<(), Error> {
        if brightness.is_nan() || brightness < 0.0 {
            return Err(Error::BadParameter("brightness must not be negative"));
        }
        Ok(self.client.set_brightness(self.id, brightness.min(1.0))?)
    }

    /// Change the power state
    pub fn set_power_mode(&self, mode: PowerMode) -> Result<(), Error> {
        if matches!(mode, PowerMode::Doze | PowerMode::DozeSuspend | PowerMode::OnSuspend) {
            return Err(Error::Unsupported("power mode"));
        }
        let mut state = self.lock();
        self.client.set_power_mode(self.id, mode)?;
        state.power_mode = mode;
        let _guard = self.span.enter();
        info!(?mode, "Power mode changed");
        Ok(())
    }

    /// Current power state
    pub fn power_mode(&self) -> PowerMode {
        self.lock().power_mode
    }

    /// Enable or disable link protection
    ///
    /// Blit targets are reallocated from matching memory on the next frame.
    pub fn set_secure_mode(&self, secure: bool) -> Result<(), Error> {
        let mut state = self.lock();
        if state.secure == secure {
            return Ok(());
        }
        self.client.set_secure_mode(self.id, secure)?;
        state.secure = secure;
        if let Some(blit) = &self.blit {
            blit.release_targets(self.id);
        }
        Ok(())
    }

    /// Start or stop vsync callbacks
    pub fn set_vsync_enabled(&self, enabled: bool) {
        if let Some(vsync) = self.vsync.get() {
            vsync.set_enabled(enabled);
        }
    }

    /// Set the buffer the client composed into
    pub fn set_client_target(&self, buffer: Option<Arc<ClientBuffer>>, fence: Option<Fence>) {
        let mut state = self.lock();
        state.client_target = buffer;
        state.client_target_fence = fence;
    }

    /// Switch configs right away
    pub fn set_active_config(&self, config: ConfigId) -> Result<(), Error> {
        self.set_active_config_with_constraints(config, ConfigChangeConstraints::default())
            .map(|_| ())
    }

    /// Switch configs at a vsync boundary
    ///
    /// With a desired time the switch happens at the first vsync after it and
    /// the active config only changes then.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn set_active_config_with_constraints(
        &self,
        config: ConfigId,
        constraints: ConfigChangeConstraints,
    ) -> Result<VsyncTimeline, Error> {
        let mut state = self.lock();
        if state.active_config == Some(config) {
            return Ok(VsyncTimeline::default());
        }
        let new = state.configs.get(&config).ok_or(Error::BadConfig(Some(config)))?;
        if constraints.seamless_required {
            if let Ok(old) = state.active() {
                if old.config_group != new.config_group {
                    debug!(
                        old = old.config_group,
                        new = new.config_group,
                        "Seamless switch across config groups"
                    );
                    return Err(Error::SeamlessNotAllowed);
                }
            }
        }
        let period = new.vsync_period;

        if constraints.desired_time.is_none() {
            self.client.set_active_config(self.id, config)?;
            state.active_config = Some(config);
        }
        let timeline = match self.vsync.get() {
            Some(vsync) => vsync.schedule_update(config, period, constraints.desired_time),
            None => VsyncTimeline::default(),
        };
        Ok(timeline)
    }

    fn take_effect_config(&self, config: ConfigId) {
        let mut state = self.lock();
        if !state.configs.contains_key(&config) {
            let _guard = self.span.enter();
            warn!(config, "Pending config vanished before it took effect");
            return;
        }
        match self.client.set_active_config(self.id, config) {
            Ok(()) => state.active_config = Some(config),
            Err(err) => {
                let _guard = self.span.enter();
                error!(config, ?err, "Failed to apply pending config");
            }
        }
    }

    /// Config persisted as the one to use at boot
    pub fn boot_config(&self) -> Result<Option<ConfigId>, Error> {
        let value = self
            .store
            .get(&self.id.to_string(), "")
            .map_err(store_error("Failed to read boot config"))?;
        let state = self.lock();
        Ok(value
            .parse::<ConfigId>()
            .ok()
            .filter(|config| state.configs.contains_key(config)))
    }

    /// Persist the config to use at boot
    pub fn set_boot_config(&self, config: ConfigId) -> Result<(), Error> {
        if !self.lock().configs.contains_key(&config) {
            return Err(Error::BadConfig(Some(config)));
        }
        self.store
            .set(&self.id.to_string(), &config.to_string())
            .map_err(store_error("Failed to save boot config"))
    }

    /// Forget the persisted boot config
    pub fn clear_boot_config(&self) -> Result<(), Error> {
        self.store
            .set(&self.id.to_string(), "")
            .map_err(store_error("Failed to clear boot config"))
    }

    /// Config the display would boot with without a persisted choice
    pub fn preferred_boot_config(&self) -> Result<ConfigId, Error> {
        self.lock()
            .configs
            .keys()
            .next()
            .copied()
            .ok_or(Error::BadConfig(None))
    }

    /// Reading back composed frames is not supported
    pub fn set_readback_buffer(&self, _buffer: Arc<ClientBuffer>, _fence: Option<Fence>) -> Result<(), Error> {
        Err(Error::Unsupported("readback"))
    }

    /// Content sampling is not supported
    pub fn set_content_sampling_enabled(&self, _enabled: bool) -> Result<(), Error> {
        Err(Error::Unsupported("content sampling"))
    }

    /// Idle timers are not supported
    pub fn set_idle_timer_enabled(&self, _timeout: Duration) -> Result<(), Error> {
        Err(Error::Unsupported("idle timer"))
    }

    /// Auto low latency mode is not supported
    pub fn set_auto_low_latency_mode(&self, _on: bool) -> Result<(), Error> {
        Err(Error::Unsupported("auto low latency mode"))
    }

    /// Decide how every layer reaches the screen
    ///
    /// Returns the composition types the client has to adopt, an empty list
    /// means the frame can be presented as submitted. Layer state is not
    /// modified.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn validate(&self) -> Result<Vec<(LayerId, Composition)>, Error> {
        let mut state = self.lock();
        state.pending_changes.clear();
        state.plan = None;

        let mut ordered = state
            .layers
            .values()
            .map(|layer| layer.state().clone())
            .collect::<Vec<_>>();
        ordered.sort_by(z_order);

        let config = state.active()?;
        let screen = (config.width, config.height).into();
        let overlays = self.client.overlay_planes(self.id)?;
        let primary = self.client.primary_plane(self.id);
        let overlay_check = |layer: &LayerState| self.client.check_overlay_limitation(self.id, layer);
        let strategy = Strategy {
            screen,
            planes: PlaneModel {
                overlay_supported: self.client.overlay_supported(self.id),
                overlays: &overlays,
                primary: primary.as_ref(),
            },
            overlay_check: &overlay_check,
            blit: self.blit.as_deref(),
            color_transform: state.color_transform.is_some(),
            secure: state.secure,
        };
        let plan = allocate(&strategy, &ordered);

        let changes = plan.changes().to_vec();
        state.present_state = if changes.is_empty() {
            PresentState::WaitingForPresent
        } else {
            PresentState::WaitingForAccept
        };
        trace!(state = ?state.present_state, changes = changes.len(), "Validated");
        state.pending_changes = changes.clone();
        state.plan = Some(plan);
        Ok(changes)
    }

    /// Changes proposed by the last [`validate`](Display::validate) and not yet accepted
    pub fn changed_composition_types(&self) -> Vec<(LayerId, Composition)> {
        self.lock().pending_changes.clone()
    }

    /// Apply the proposed composition types to the layers
    pub fn accept_changes(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if state.present_state == PresentState::WaitingForValidate {
            let _guard = self.span.enter();
            error!("Changes accepted before validation");
            return Err(Error::NotValidated);
        }

        for (id, composition) in mem::take(&mut state.pending_changes) {
            match state.layers.get_mut(&id) {
                Some(layer) => layer.set_composition(composition),
                None => {
                    let _guard = self.span.enter();
                    warn!(layer = %id, "Layer destroyed before its changes were accepted");
                }
            }
        }
        state.present_state = PresentState::WaitingForPresent;
        Ok(())
    }

    /// Show the validated frame
    ///
    /// The display always needs a new validation afterwards, whether this
    /// succeeds or not.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    #[profiling::function]
    pub fn present(&self) -> Result<PresentFences, Error> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match mem::replace(&mut state.present_state, PresentState::WaitingForValidate) {
            PresentState::WaitingForValidate => {
                error!("Present without validation");
                return Err(Error::NotValidated);
            }
            PresentState::WaitingForAccept => {
                error!("Present before changes were accepted");
                state.pending_changes.clear();
                return Err(Error::NotValidated);
            }
            PresentState::WaitingForPresent => {}
        }
        let plan = state.plan.take().ok_or(Error::NotValidated)?;

        let mut frame = FrameRequest::default();
        let mut device_layers = Vec::new();
        for (id, plane) in plan.overlays() {
            let Some(layer) = state.layers.get_mut(&id) else {
                continue;
            };
            let Some(buffer) = layer.state().buffer.clone() else {
                continue;
            };
            frame.overlays.push(PlaneCommit {
                layer: id,
                plane,
                buffer,
                source: layer.state().source_crop,
                destination: layer.state().display_frame,
                fence: layer.take_acquire_fence(),
            });
            device_layers.push(id);
        }

        frame.primary = if let Some(id) = plan.passthrough() {
            state.layers.get_mut(&id).and_then(|layer| {
                let buffer = layer.state().buffer.clone()?;
                device_layers.push(id);
                Some(PrimaryCommit {
                    buffer,
                    fence: layer.take_acquire_fence(),
                })
            })
        } else if plan.blit_layers().next().is_some() {
            Some(self.compose(state, &plan)?)
        } else if plan.needs_client_target() {
            match state.client_target.clone() {
                Some(buffer) => Some(PrimaryCommit {
                    buffer,
                    fence: state.client_target_fence.take(),
                }),
                None => {
                    warn!("Client composition requested without a client target");
                    None
                }
            }
        } else {
            None
        };

        // the sink follows the topmost layer carrying metadata
        let hdr = plan
            .routes()
            .iter()
            .filter_map(|(id, _)| state.layers.get(id))
            .filter_map(|layer| layer.state().hdr_metadata)
            .last();
        if hdr != state.hdr_metadata {
            match self.client.set_hdr_metadata(self.id, hdr.as_ref()) {
                Ok(()) => state.hdr_metadata = hdr,
                Err(err) => debug!(?err, "HDR metadata not forwarded"),
            }
        }

        let display_fence = self.client.flush(self.id, frame).map_err(|err| {
            error!(?err, "Frame dropped");
            Error::from(err)
        })?;

        state.last_fence = display_fence.as_ref().and_then(|fence| fence.duplicate().ok());
        let layers = share_fence(display_fence.as_ref(), &device_layers);
        state.last_device_layers = device_layers;
        Ok(PresentFences {
            display: display_fence,
            layers,
        })
    }

    fn compose(&self, state: &mut DisplayState, plan: &Plan) -> Result<PrimaryCommit, Error> {
        let blit = self.blit.as_ref().ok_or(Error::NoResources {
            errmsg: "No blit engine",
            source: None,
        })?;
        let mut layers = Vec::new();
        for id in plan.blit_layers() {
            if let Some(layer) = state.layers.get_mut(&id) {
                wait_fence(layer.take_acquire_fence(), self.fence_timeout, "acquire");
                layers.push(layer.state().clone());
            }
        }

        let config = state.active()?;
        let spec = TargetSpec {
            size: (config.width, config.height).into(),
            format: self.client.target_format(self.id),
            secure: state.secure,
        };
        let buffer = blit.compose(self.id, spec, &layers).map_err(|err| Error::NoResources {
            errmsg: "Blit composition failed",
            source: Some(err.into()),
        })?;
        Ok(PrimaryCommit { buffer, fence: None })
    }

    /// Release fences of the last presented frame
    pub fn release_fences(&self) -> Vec<(LayerId, Option<Fence>)> {
        let state = self.lock();
        share_fence(state.last_fence.as_ref(), &state.last_device_layers)
    }

    /// Adopt a config set rebuilt after a hotplug
    pub(crate) fn update_configs(&self, connected: bool, configs: DisplayConfigs) {
        let mut state = self.lock();
        state.connected = connected;
        state.set_configs(configs);
        state.present_state = PresentState::WaitingForValidate;
        state.plan = None;
        state.edid = self.client.edid(self.id).unwrap_or_else(|| LEGACY_EDID.to_vec());

        let _guard = self.span.enter();
        match state.active() {
            Ok(config) => {
                info!(config = config.id, connected, "Display configs updated");
                if let Some(vsync) = self.vsync.get() {
                    vsync.schedule_update(config.id, config.vsync_period, None);
                }
            }
            Err(_) => warn!(connected, "Display has no active config after hotplug"),
        }
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if let Some(blit) = &self.blit {
            blit.release_targets(self.id);
        }
    }
}

fn port(id: DisplayId) -> u8 {
    u8::try_from(id).unwrap_or_else(|_| {
        warn!(display = id, "Display id exceeds the port range");
        u8::MAX
    })
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        backend::{
            allocator::{test::buffer_with, BufferUsage, Fourcc, Modifier},
            blit::{test::composer, BlitFeatures},
            drm::{
                commit::{ObjectRef, PropValue},
                device::test::MockDevice,
                topology::{
                    test::{connector, crtc, mode, plane},
                    PlaneId, PlaneKind, Topology,
                },
                DrmClient,
            },
            sync::test::{signal, unsignaled},
        },
        utils::{Monotonic, Rectangle},
    };

    pub(crate) fn topology() -> Topology {
        Topology {
            crtcs: vec![crtc(10, 0)],
            planes: vec![
                plane(20, PlaneKind::Primary, 0b1, &[(Fourcc::Abgr8888, &[]), (Fourcc::Xrgb8888, &[])]),
                plane(21, PlaneKind::Overlay, 0b1, &[(Fourcc::Nv12, &[])]),
                plane(22, PlaneKind::Overlay, 0b1, &[(Fourcc::Nv12, &[])]),
            ],
            connectors: vec![connector(30, 0b1, vec![mode(1920, 1080, 60, true), mode(1280, 720, 50, false)])],
        }
    }

    pub(crate) fn settings(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            hardware_vsync: false,
            backlight_root: "/nonexistent".into(),
            store_path: dir.join("settings.json"),
            fence_timeout_ms: 50,
            ..Default::default()
        }
    }

    struct Fixture {
        mock: Arc<MockDevice>,
        display: Arc<Display>,
        _dir: tempfile::TempDir,
    }

    fn fixture(blit: Option<Arc<BlitComposer>>) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mock = Arc::new(MockDevice::new(topology()));
        let client: Arc<dyn DeviceClient> = Arc::new(DrmClient::new(mock.clone(), &settings).unwrap());
        let display = Display::new(
            0,
            client,
            blit,
            Arc::new(Store::new(&settings.store_path)),
            CallbackSlot::default(),
            Arc::new(Monotonic),
            &settings,
        )
        .unwrap();
        Fixture {
            mock,
            display,
            _dir: dir,
        }
    }

    fn add_layer(display: &Display, z: u32, frame: Rectangle<i32, crate::utils::Display>, format: Fourcc) -> LayerId {
        let id = display.create_layer();
        display
            .with_layer(id, |layer| {
                layer.set_z_order(z);
                layer.set_display_frame(frame);
                layer.set_source_crop(Rectangle::from_size(
                    (frame.size.w as f64, frame.size.h as f64).into(),
                ));
                layer.set_buffer(
                    Some(Arc::new(buffer_with(
                        frame.size.w,
                        frame.size.h,
                        format,
                        Modifier::Linear,
                        BufferUsage::empty(),
                    ))),
                    None,
                );
            })
            .unwrap();
        id
    }

    fn full() -> Rectangle<i32, crate::utils::Display> {
        Rectangle::from_ltrb(0, 0, 1920, 1080)
    }

    #[test]
    fn fullscreen_video_goes_straight_to_a_plane() {
        let f = fixture(None);
        let id = add_layer(&f.display, 0, full(), Fourcc::Nv12);

        assert!(f.display.validate().unwrap().is_empty());
        assert_eq!(f.display.present_state(), PresentState::WaitingForPresent);
        let fences = f.display.present().unwrap();

        assert!(fences.display.is_some());
        assert_eq!(fences.layers.len(), 1);
        assert_eq!(fences.layers[0].0, id);
        assert!(fences.layers[0].1.is_some());

        let (request, _) = f.mock.last_commit().unwrap();
        assert_eq!(
            request.get(ObjectRef::Plane(PlaneId(21)), "CRTC_ID"),
            Some(PropValue::Object(10))
        );
        assert_eq!(request.get(ObjectRef::Plane(PlaneId(22)), "FB_ID"), None);
        assert_eq!(f.display.present_state(), PresentState::WaitingForValidate);
    }

    #[test]
    fn call_order_is_enforced() {
        let f = fixture(None);
        assert!(matches!(f.display.present(), Err(Error::NotValidated)));
        assert!(matches!(f.display.accept_changes(), Err(Error::NotValidated)));

        // rgb layers cannot use the overlays and nothing can blend them
        add_layer(&f.display, 0, Rectangle::from_ltrb(0, 0, 100, 100), Fourcc::Abgr8888);
        let changes = f.display.validate().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(f.display.present_state(), PresentState::WaitingForAccept);
        assert!(matches!(f.display.present(), Err(Error::NotValidated)));
        // a refused present still requires a new validation
        assert_eq!(f.display.present_state(), PresentState::WaitingForValidate);
        assert!(matches!(f.display.accept_changes(), Err(Error::NotValidated)));

        assert_eq!(f.display.validate().unwrap(), changes);
        f.display.accept_changes().unwrap();
        f.display.set_client_target(Some(Arc::new(buffer_with(
            1920,
            1080,
            Fourcc::Abgr8888,
            Modifier::Linear,
            BufferUsage::empty(),
        ))), None);
        let fences = f.display.present().unwrap();
        assert!(fences.layers.is_empty());
        assert!(matches!(f.display.present(), Err(Error::NotValidated)));
    }

    #[test]
    fn validation_is_idempotent() {
        let f = fixture(None);
        add_layer(&f.display, 0, full(), Fourcc::Nv12);
        add_layer(&f.display, 1, Rectangle::from_ltrb(0, 0, 300, 300), Fourcc::Abgr8888);
        add_layer(&f.display, 2, Rectangle::from_ltrb(500, 500, 900, 900), Fourcc::Nv12);
        let first = f.display.validate().unwrap();
        for _ in 0..5 {
            assert_eq!(f.display.validate().unwrap(), first);
        }
        assert_eq!(f.display.changed_composition_types(), first);
    }

    #[test]
    fn accepted_changes_reach_the_layers() {
        let f = fixture(None);
        let id = add_layer(&f.display, 0, Rectangle::from_ltrb(0, 0, 10, 10), Fourcc::Abgr8888);
        f.display.validate().unwrap();
        f.display.accept_changes().unwrap();
        assert_eq!(f.display.layer_state(id).unwrap().composition, Composition::Client);
        // the next validation starts from the accepted types
        assert!(f.display.validate().unwrap().is_empty());
    }

    #[test]
    fn failed_commit_resets_the_cycle() {
        let f = fixture(None);
        add_layer(&f.display, 0, full(), Fourcc::Nv12);
        f.display.validate().unwrap();
        f.mock.fail_commit.store(true, Ordering::SeqCst);
        assert!(matches!(f.display.present(), Err(Error::NoResources { .. })));
        assert_eq!(f.display.present_state(), PresentState::WaitingForValidate);
    }

    #[test]
    fn blended_layers_wait_for_their_fences() {
        let (blit, ops) = composer(BlitFeatures::empty());
        let f = fixture(Some(Arc::new(blit)));
        let a = add_layer(&f.display, 0, full(), Fourcc::Abgr8888);
        let b = add_layer(&f.display, 1, Rectangle::from_ltrb(10, 10, 200, 200), Fourcc::Abgr8888);
        let fence = unsignaled();
        signal(&fence);
        f.display
            .with_layer(b, |layer| {
                let buffer = layer.state().buffer.clone();
                layer.set_buffer(buffer, Some(fence));
            })
            .unwrap();

        assert!(f.display.validate().unwrap().is_empty());
        let fences = f.display.present().unwrap();
        // blended buffers are free once the blit finished
        assert!(fences.layers.is_empty());
        assert!(ops.lock().unwrap().iter().any(|op| matches!(op, crate::backend::blit::test::Op::Finish)));
        let (request, _) = f.mock.last_commit().unwrap();
        assert!(request.get(ObjectRef::Plane(PlaneId(20)), "FB_ID").is_some());
        let _ = a;
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let f = fixture(None);
        let bogus = LayerId::from_raw(u64::MAX);
        assert!(matches!(f.display.destroy_layer(bogus), Err(Error::BadLayer(_))));
        assert!(matches!(f.display.with_layer(bogus, |_| ()), Err(Error::BadLayer(_))));
        assert!(matches!(f.display.config(999), Err(Error::BadConfig(Some(999)))));
        assert!(matches!(f.display.set_active_config(999), Err(Error::BadConfig(_))));
        assert!(matches!(f.display.set_brightness(-1.0), Err(Error::BadParameter(_))));
        assert!(matches!(f.display.set_color_transform(&[1.0; 4]), Err(Error::BadParameter(_))));
        assert!(matches!(
            f.display.set_power_mode(PowerMode::Doze),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            f.display.set_content_type(ContentType::Game),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn attributes_and_identification() {
        let f = fixture(None);
        let active = f.display.active_config().unwrap();
        assert_eq!(f.display.attribute(active, DisplayAttribute::Width).unwrap(), 1920);
        assert_eq!(f.display.attribute(active, DisplayAttribute::Height).unwrap(), 1080);
        assert_eq!(f.display.attribute(active, DisplayAttribute::DpiX).unwrap(), 160);
        assert_eq!(f.display.configs().len(), 2);
        let (port, edid) = f.display.identification_data();
        assert_eq!(port, 0);
        assert_eq!(super::port(0x40), 0x40);
        assert_eq!(super::port(0x140), u8::MAX);
        assert_eq!(edid, LEGACY_EDID.to_vec());
        assert_eq!(edid.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)), 0);
        assert_eq!(f.display.color_modes(), vec![ColorMode::Native]);
        f.display
            .set_color_mode(ColorMode::Native, RenderIntent::Colorimetric)
            .unwrap();
        assert!(f
            .display
            .set_color_mode(ColorMode::DisplayP3, RenderIntent::Colorimetric)
            .is_err());
    }

    #[test]
    fn boot_config_round_trip() {
        let f = fixture(None);
        let configs = f.display.configs();
        assert_eq!(f.display.boot_config().unwrap(), None);
        assert_eq!(f.display.preferred_boot_config().unwrap(), configs[0]);
        f.display.set_boot_config(configs[1]).unwrap();
        assert_eq!(f.display.boot_config().unwrap(), Some(configs[1]));
        assert!(matches!(f.display.set_boot_config(999), Err(Error::BadConfig(_))));
        f.display.clear_boot_config().unwrap();
        assert_eq!(f.display.boot_config().unwrap(), None);
    }

    #[test]
    fn immediate_and_deferred_config_changes() {
        let f = fixture(None);
        let configs = f.display.configs();
        let active = f.display.active_config().unwrap();
        let other = *configs.iter().find(|id| **id != active).unwrap();

        f.display.set_active_config(other).unwrap();
        assert_eq!(f.display.active_config().unwrap(), other);
        assert_eq!(f.display.vsync_period().unwrap(), Duration::from_nanos(20_000_000));

        // far in the future, nothing changes yet
        let timeline = f
            .display
            .set_active_config_with_constraints(
                active,
                ConfigChangeConstraints {
                    desired_time: Some(Monotonic.now() + Duration::from_secs(3600)),
                    seamless_required: false,
                },
            )
            .unwrap();
        assert!(timeline.new_vsync_applied_time > Monotonic.now());
        assert_eq!(f.display.active_config().unwrap(), other);
    }

    #[test]
    fn seamless_switch_needs_the_same_group() {
        let f = fixture(None);
        let active = f.display.active_config().unwrap();
        let other = *f.display.configs().iter().find(|id| **id != active).unwrap();
        let state = f.display.config(active).unwrap();
        {
            let mut guard = f.display.lock();
            guard.configs.get_mut(&other).unwrap().config_group = state.config_group + 1;
        }
        let result = f.display.set_active_config_with_constraints(
            other,
            ConfigChangeConstraints {
                desired_time: None,
                seamless_required: true,
            },
        );
        assert!(matches!(result, Err(Error::SeamlessNotAllowed)));
    }

    #[test]
    fn identity_color_transform_is_no_transform() {
        let f = fixture(None);
        let mut identity = [0.0f32; 16];
        for i in 0..4 {
            identity[i * 5] = 1.0;
        }
        f.display.set_color_transform(&identity).unwrap();
        assert!(f.display.lock().color_transform.is_none());
        identity[0] = 0.5;
        f.display.set_color_transform(&identity).unwrap();
        assert!(f.display.lock().color_transform.is_some());
    }
}
