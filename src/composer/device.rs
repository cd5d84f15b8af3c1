use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock, Weak},
};

use tracing::{debug, error, info, info_span, warn};

use crate::{
    backend::{blit::BlitComposer, DeviceClient, HotplugEvent},
    utils::{unpoison, Monotonic, TimeSource},
};

use super::{
    config::EngineConfig,
    display::Display,
    layer::LayerId,
    store::Store,
    CallbackSlot, ComposerCallback, DisplayId, Error,
};

/// Shared between the [`Composer`] and the hotplug handler it installs
struct Registry {
    client: Arc<dyn DeviceClient>,
    blit: Option<Arc<BlitComposer>>,
    store: Arc<Store>,
    callbacks: CallbackSlot,
    clock: Arc<dyn TimeSource>,
    settings: EngineConfig,
    displays: RwLock<HashMap<DisplayId, Arc<Display>>>,
    span: tracing::Span,
}

impl Registry {
    fn create_display(&self, id: DisplayId) -> Result<Arc<Display>, Error> {
        Display::new(
            id,
            self.client.clone(),
            self.blit.clone(),
            self.store.clone(),
            self.callbacks.clone(),
            self.clock.clone(),
            &self.settings,
        )
    }

    fn on_hotplug(&self, event: HotplugEvent) {
        let _guard = self.span.enter();
        info!(display = event.display, connected = event.connected, "Hotplug");

        let existing = unpoison(self.displays.read()).get(&event.display).cloned();
        let primary = self.client.primary_display() == Some(event.display);
        match (existing, event.connected || primary) {
            (Some(display), true) => display.update_configs(event.connected, event.configs),
            (Some(_), false) => {
                let removed = unpoison(self.displays.write()).remove(&event.display);
                // joins the vsync thread, which may call back into the registry
                drop(removed);
                debug!(display = event.display, "Display removed");
            }
            (None, true) => match self.create_display(event.display) {
                Ok(display) => {
                    unpoison(self.displays.write()).insert(event.display, display);
                }
                Err(err) => {
                    error!(display = event.display, ?err, "Failed to set up hotplugged display");
                    return;
                }
            },
            (None, false) => {}
        }

        if let Some(callback) = self.callbacks.get() {
            callback.on_hotplug(event.display, event.connected || primary);
        }
    }
}

/// Entry point of the engine
///
/// Owns the [`Display`]s of one [`DeviceClient`] and keeps them in sync with
/// its hotplug events.
pub struct Composer {
    registry: Arc<Registry>,
    #[cfg(feature = "backend_udev")]
    monitor: Option<crate::backend::udev::HotplugMonitor>,
}

impl fmt::Debug for Composer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("client", &self.registry.client)
            .field("blit", &self.registry.blit)
            .field("displays", &self.displays())
            .finish_non_exhaustive()
    }
}

impl Composer {
    /// Open the primary card of `seat0`, falling back to `/dev/fb0`
    ///
    /// Hotplug events of the card are monitored until the composer is dropped.
    #[cfg(all(feature = "backend_drm", feature = "backend_udev"))]
    pub fn open(settings: EngineConfig) -> Result<Composer, Error> {
        use crate::backend::{drm::DrmClient, udev};

        let span = info_span!("composer");
        let _guard = span.enter();

        let gpu = udev::primary_gpu("seat0").unwrap_or_else(|err| {
            warn!(?err, "Failed to enumerate drm devices");
            None
        });
        let client: Arc<dyn DeviceClient> = match &gpu {
            Some(path) => {
                info!(?path, "Using primary gpu");
                let client = DrmClient::open(path, &settings).map_err(crate::backend::Error::from)?;
                Arc::new(client)
            }
            #[cfg(feature = "backend_fbdev")]
            None => {
                info!("No drm device, using frame buffer");
                let client = crate::backend::fbdev::FbdevClient::open("/dev/fb0", &settings)
                    .map_err(crate::backend::Error::from)?;
                Arc::new(client)
            }
            #[cfg(not(feature = "backend_fbdev"))]
            None => {
                return Err(Error::NoResources {
                    errmsg: "No display device found",
                    source: None,
                })
            }
        };
        drop(_guard);

        let mut composer = Composer::new(client.clone(), settings)?;
        if gpu.is_some() {
            match udev::HotplugMonitor::spawn(client, gpu) {
                Ok(monitor) => composer.monitor = Some(monitor),
                Err(err) => warn!(?err, "Hotplug monitoring unavailable"),
            }
        }
        Ok(composer)
    }

    /// Set up displays for every display of `client`
    ///
    /// The blit engine is loaded when enabled in `settings` and available.
    pub fn new(client: Arc<dyn DeviceClient>, settings: EngineConfig) -> Result<Composer, Error> {
        let blit = if settings.blit_enabled {
            load_blit(&settings)
        } else {
            None
        };
        Composer::with_blit(client, blit, Arc::new(Monotonic), settings)
    }

    /// Like [`Composer::new`] with an explicit blit engine and time source
    pub fn with_blit(
        client: Arc<dyn DeviceClient>,
        blit: Option<BlitComposer>,
        clock: Arc<dyn TimeSource>,
        settings: EngineConfig,
    ) -> Result<Composer, Error> {
        let span = info_span!("composer");
        let registry = Arc::new(Registry {
            client: client.clone(),
            blit: blit.map(Arc::new),
            store: Arc::new(Store::new(&settings.store_path)),
            callbacks: CallbackSlot::default(),
            clock,
            settings,
            displays: RwLock::new(HashMap::new()),
            span,
        });

        for id in client.displays() {
            let display = registry.create_display(id)?;
            unpoison(registry.displays.write()).insert(id, display);
        }

        let weak: Weak<Registry> = Arc::downgrade(&registry);
        client.set_hotplug_handler(Arc::new(move |event| {
            if let Some(registry) = weak.upgrade() {
                registry.on_hotplug(event);
            }
        }));

        {
            let _guard = registry.span.enter();
            info!(
                displays = unpoison(registry.displays.read()).len(),
                blit = registry.blit.is_some(),
                "Composer ready"
            );
        }
        Ok(Composer {
            registry,
            #[cfg(feature = "backend_udev")]
            monitor: None,
        })
    }

    /// Register the receiver of hotplug, vsync and refresh events
    ///
    /// Every connected display is reported through
    /// [`ComposerCallback::on_hotplug`] right away.
    pub fn register_callback(&self, callback: Arc<dyn ComposerCallback>) {
        self.registry.callbacks.set(Some(callback.clone()));
        for id in self.displays() {
            if let Ok(display) = self.display(id) {
                callback.on_hotplug(id, display.is_connected());
            }
        }
    }

    /// Stop delivering events
    pub fn unregister_callback(&self) {
        self.registry.callbacks.set(None);
    }

    /// Look up a display
    pub fn display(&self, id: DisplayId) -> Result<Arc<Display>, Error> {
        unpoison(self.registry.displays.read())
            .get(&id)
            .cloned()
            .ok_or(Error::BadDisplay(id))
    }

    /// Ids of all known displays, ascending
    pub fn displays(&self) -> Vec<DisplayId> {
        let mut ids = unpoison(self.registry.displays.read()).keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Create a layer on a display
    pub fn create_layer(&self, display: DisplayId) -> Result<LayerId, Error> {
        Ok(self.display(display)?.create_layer())
    }

    /// Destroy a layer of a display
    pub fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> Result<(), Error> {
        self.display(display)?.destroy_layer(layer)
    }

    /// The hardware client driving the displays
    pub fn client(&self) -> &Arc<dyn DeviceClient> {
        &self.registry.client
    }

    /// Virtual displays are not supported
    pub fn max_virtual_display_count(&self) -> u32 {
        0
    }

    /// Re-probe the hardware, as if a hotplug event had arrived
    pub fn rescan(&self) -> Result<(), Error> {
        Ok(self.registry.client.handle_hotplug()?)
    }
}

#[cfg(feature = "backend_g2d")]
fn load_blit(settings: &EngineConfig) -> Option<BlitComposer> {
    match crate::backend::blit::g2d::G2dEngine::open(settings.blit_library.as_deref()) {
        Ok(engine) => Some(BlitComposer::new(Box::new(engine), settings.composer_targets)),
        Err(err) => {
            warn!(?err, "Blit engine unavailable, blending falls back to the client");
            None
        }
    }
}

#[cfg(not(feature = "backend_g2d"))]
fn load_blit(_settings: &EngineConfig) -> Option<BlitComposer> {
    None
}

#[cfg(test)]
mod test {
    use std::{
        sync::{mpsc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::backend::drm::{
        device::test::MockDevice,
        topology::{
            test::{connector, crtc, mode, plane},
            ConnectorId, ConnectorStatus, PlaneKind, Topology,
        },
        DrmClient,
    };
    use crate::backend::allocator::Fourcc;
    use crate::composer::display::test::settings;

    #[derive(Debug)]
    struct Events(Mutex<mpsc::Sender<(DisplayId, bool)>>);

    impl ComposerCallback for Events {
        fn on_hotplug(&self, display: DisplayId, connected: bool) {
            let _ = self.0.lock().unwrap().send((display, connected));
        }

        fn on_vsync(&self, _display: DisplayId, _timestamp: Duration, _period: Duration) {}
    }

    fn two_heads() -> Topology {
        Topology {
            crtcs: vec![crtc(10, 0), crtc(11, 1)],
            planes: vec![
                plane(20, PlaneKind::Primary, 0b01, &[(Fourcc::Abgr8888, &[])]),
                plane(21, PlaneKind::Primary, 0b10, &[(Fourcc::Abgr8888, &[])]),
            ],
            connectors: vec![
                connector(30, 0b01, vec![mode(1920, 1080, 60, true)]),
                connector(31, 0b10, vec![]),
            ],
        }
    }

    fn composer() -> (Arc<MockDevice>, Composer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mock = Arc::new(MockDevice::new(two_heads()));
        let client = Arc::new(DrmClient::new(mock.clone(), &settings).unwrap());
        let composer = Composer::with_blit(client, None, Arc::new(Monotonic), settings).unwrap();
        (mock, composer, dir)
    }

    #[test]
    fn displays_follow_the_client() {
        let (_, composer, _dir) = composer();
        assert_eq!(composer.displays(), vec![0]);
        assert!(matches!(composer.display(1), Err(Error::BadDisplay(1))));
        let layer = composer.create_layer(0).unwrap();
        composer.destroy_layer(0, layer).unwrap();
        assert!(matches!(composer.destroy_layer(0, layer), Err(Error::BadLayer(_))));
        assert!(matches!(composer.create_layer(5), Err(Error::BadDisplay(5))));
    }

    #[test]
    fn registering_reports_connected_displays() {
        let (_, composer, _dir) = composer();
        let (tx, rx) = mpsc::channel();
        composer.register_callback(Arc::new(Events(Mutex::new(tx))));
        assert_eq!(rx.try_recv().unwrap(), (0, true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hotplug_adds_and_removes_external_displays() {
        let (mock, composer, _dir) = composer();
        let (tx, rx) = mpsc::channel();
        composer.register_callback(Arc::new(Events(Mutex::new(tx))));
        let _ = rx.try_recv();

        {
            let mut topology = mock.topology.lock().unwrap();
            topology.connectors[1].modes = vec![mode(1280, 720, 60, true)];
        }
        mock.set_connector_status(ConnectorId(31), ConnectorStatus::Connected);
        composer.rescan().unwrap();
        assert_eq!(rx.try_recv().unwrap(), (1, true));
        assert_eq!(composer.displays(), vec![0, 1]);
        let external = composer.display(1).unwrap();
        assert_eq!(external.config(external.active_config().unwrap()).unwrap().width, 1280);

        mock.set_connector_status(ConnectorId(31), ConnectorStatus::Disconnected);
        composer.rescan().unwrap();
        assert_eq!(rx.try_recv().unwrap(), (1, false));
        assert_eq!(composer.displays(), vec![0]);
    }

    #[test]
    fn primary_display_survives_unplugging() {
        let (mock, composer, _dir) = composer();
        let before = composer.display(0).unwrap().active_config().unwrap();

        mock.set_connector_status(ConnectorId(30), ConnectorStatus::Disconnected);
        composer.rescan().unwrap();
        assert_eq!(composer.displays(), vec![0]);
        let display = composer.display(0).unwrap();
        assert!(display.is_connected());
        // the placeholder config keeps the last size under a fresh id
        let placeholder = display.active_config().unwrap();
        assert_ne!(placeholder, before);
        assert_eq!(display.config(placeholder).unwrap().width, 1920);

        // frames go nowhere until the sink returns
        display.validate().unwrap();
        assert!(display.present().unwrap().display.is_none());
    }
}
