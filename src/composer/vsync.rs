//! Per-display vsync generation
//!
//! Every display owns a [`VsyncScheduler`], a thread that produces one event
//! per refresh. It waits for the hardware vblank when the display offers one
//! and falls back to sleeping until the next software deadline, which stays in
//! phase with the last observed vsync.
//!
//! Refresh period changes requested for a later point in time are kept pending
//! and applied by the first vsync past that point, so a period never changes
//! in the middle of a refresh.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, info, info_span, trace};

use crate::{
    backend::{DisplayId, Error as BackendError},
    utils::{unpoison, TimeSource},
};

use super::config::ConfigId;

const LOG_INTERVAL: Duration = Duration::from_secs(60);

/// When a refresh period change becomes visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VsyncTimeline {
    /// Timestamp of the first vsync using the new period
    pub new_vsync_applied_time: Duration,
    /// Whether the client has to present a frame before the change
    pub refresh_required: bool,
    /// When that frame has to be presented
    pub refresh_time: Duration,
}

/// Receiver of scheduler events
///
/// Both methods are called from the scheduler thread without any scheduler
/// lock held.
pub trait VsyncHandler: Send + Sync {
    /// A refresh happened at `timestamp` with the given period
    fn vsync(&self, display: DisplayId, timestamp: Duration, period: Duration);

    /// A pending config change reached its vsync
    fn config_applied(&self, display: DisplayId, config: ConfigId);
}

/// Blocks until the next hardware vblank and returns its timestamp
pub type VblankSource = Box<dyn Fn() -> Result<Duration, BackendError> + Send>;

/// Returns the first vsync after `now` that is a whole number of periods after `previous`
pub fn next_vsync_in_phase(period: Duration, previous: Duration, now: Duration) -> Duration {
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return now;
    }
    let elapsed = now.saturating_sub(previous).as_nanos();
    let periods = elapsed / period_ns + 1;
    Duration::from_nanos((previous.as_nanos() + periods * period_ns) as u64)
}

#[derive(Debug, Clone, Copy)]
struct PendingUpdate {
    config: ConfigId,
    period: Duration,
    after: Duration,
}

#[derive(Debug)]
struct Timing {
    enabled: bool,
    period: Duration,
    previous: Duration,
    pending: Option<PendingUpdate>,
}

impl Timing {
    fn schedule(&mut self, config: ConfigId, period: Duration, desired: Option<Duration>) -> VsyncTimeline {
        let update_time = match desired {
            None => {
                self.period = period;
                self.pending = None;
                self.previous
            }
            Some(after) => {
                self.pending = Some(PendingUpdate { config, period, after });
                after
            }
        };
        VsyncTimeline {
            new_vsync_applied_time: next_vsync_in_phase(self.period, self.previous, update_time),
            refresh_required: false,
            refresh_time: Duration::ZERO,
        }
    }

    /// Records a vsync, applying a pending update whose time has passed
    fn observe(&mut self, timestamp: Duration) -> (Duration, Option<ConfigId>) {
        self.previous = timestamp;
        let applied = match self.pending {
            Some(update) if timestamp > update.after => {
                self.period = update.period;
                self.pending = None;
                Some(update.config)
            }
            _ => None,
        };
        (self.period, applied)
    }
}

#[derive(Debug)]
struct Shared {
    timing: Mutex<Timing>,
    shutdown: AtomicBool,
}

/// Background vsync thread of one display
#[derive(Debug)]
pub struct VsyncScheduler {
    display: DisplayId,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    span: tracing::Span,
}

impl VsyncScheduler {
    /// Start generating vsyncs with the given period
    ///
    /// Events are only delivered once enabled with [`set_enabled`](VsyncScheduler::set_enabled).
    pub fn spawn(
        display_id: DisplayId,
        period: Duration,
        clock: Arc<dyn TimeSource>,
        vblank: Option<VblankSource>,
        handler: Arc<dyn VsyncHandler>,
    ) -> io::Result<VsyncScheduler> {
        let span = info_span!("vsync", display = display_id);
        let shared = Arc::new(Shared {
            timing: Mutex::new(Timing {
                enabled: false,
                period,
                previous: clock.now().saturating_sub(period),
                pending: None,
            }),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let thread_span = span.clone();
        let thread = thread::Builder::new()
            .name(format!("display_{}_vsync", display_id))
            .spawn(move || {
                let _guard = thread_span.enter();
                run(display_id, &thread_shared, clock.as_ref(), vblank.as_ref(), handler.as_ref());
            })?;

        Ok(VsyncScheduler {
            display: display_id,
            shared,
            thread: Some(thread),
            span,
        })
    }

    /// Start or stop delivering vsync events
    pub fn set_enabled(&self, enabled: bool) {
        let _guard = self.span.enter();
        debug!(enabled, "Vsync delivery changed");
        unpoison(self.shared.timing.lock()).enabled = enabled;
    }

    /// Whether vsync events are delivered
    pub fn is_enabled(&self) -> bool {
        unpoison(self.shared.timing.lock()).enabled
    }

    /// Refresh period currently used for scheduling
    pub fn period(&self) -> Duration {
        unpoison(self.shared.timing.lock()).period
    }

    /// Switch to a new refresh period
    ///
    /// Without `desired_time` the period changes right away and the caller
    /// applies `config` itself. Otherwise the change is deferred to the first
    /// vsync after `desired_time`, which reports it through
    /// [`VsyncHandler::config_applied`].
    pub fn schedule_update(
        &self,
        config: ConfigId,
        period: Duration,
        desired_time: Option<Duration>,
    ) -> VsyncTimeline {
        let timeline = unpoison(self.shared.timing.lock()).schedule(config, period, desired_time);
        let _guard = self.span.enter();
        info!(
            config,
            period_ns = period.as_nanos() as u64,
            applied_ns = timeline.new_vsync_applied_time.as_nanos() as u64,
            "Scheduled vsync period change"
        );
        timeline
    }
}

impl Drop for VsyncScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // the last owner of a display may be its own vsync handler
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
        let _guard = self.span.enter();
        debug!(display = self.display, "Vsync thread stopped");
    }
}

fn run(
    display: DisplayId,
    shared: &Shared,
    clock: &dyn TimeSource,
    vblank: Option<&VblankSource>,
    handler: &dyn VsyncHandler,
) {
    info!("Vsync thread starting");
    let mut vsyncs = 0u32;
    let mut last_log = clock.now();

    while !shared.shutdown.load(Ordering::Acquire) {
        let now = clock.now();
        let (enabled, period, previous) = {
            let timing = unpoison(shared.timing.lock());
            (timing.enabled, timing.period, timing.previous)
        };

        let hardware = match vblank {
            Some(wait) if enabled => match wait() {
                Ok(timestamp) if timestamp.is_zero() => Some(now),
                Ok(timestamp) => Some(timestamp),
                Err(err) => {
                    trace!(?err, "Hardware vblank unavailable, using software timing");
                    None
                }
            },
            _ => None,
        };
        let timestamp = match hardware {
            Some(timestamp) => timestamp,
            None => {
                let deadline = next_vsync_in_phase(period, previous, now);
                clock.sleep_until(deadline);
                deadline
            }
        };

        let (enabled, period, applied) = {
            let mut timing = unpoison(shared.timing.lock());
            let (period, applied) = timing.observe(timestamp);
            (timing.enabled, period, applied)
        };

        if let Some(config) = applied {
            info!(config, period_ns = period.as_nanos() as u64, "Applied pending config");
            handler.config_applied(display, config);
        }
        if enabled {
            handler.vsync(display, timestamp, period);
        }

        vsyncs += 1;
        if now > last_log + LOG_INTERVAL {
            debug!(vsyncs, "Vsyncs in the last {}s", LOG_INTERVAL.as_secs());
            last_log = now;
            vsyncs = 0;
        }
    }

    info!("Vsync thread finished");
}
