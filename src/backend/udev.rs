//! `udev` based hotplug detection
//!
//! [`HotplugMonitor`] watches the `drm` subsystem on a thread of its own and
//! asks a [`DeviceClient`] to re-probe its connectors whenever the kernel
//! reports a change of the monitored card.
//!
//! [`primary_gpu`] finds the card node to open in the first place.

use std::{
    ffi::OsString,
    io,
    os::unix::io::{AsRawFd, BorrowedFd},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
};

use rustix::event::{poll, PollFd, PollFlags};
use tracing::{debug, error, info, info_span, trace, warn};
use udev::{Enumerator, EventType, MonitorBuilder};

use super::DeviceClient;

/// Poll timeout of the monitor thread, bounds how long dropping the monitor blocks
const POLL_TIMEOUT_MS: i32 = 500;

/// Thread forwarding `drm` change events to [`DeviceClient::handle_hotplug`]
#[derive(Debug)]
pub struct HotplugMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Start monitoring
    ///
    /// With `devnode` set, only events of that card are forwarded.
    pub fn spawn(client: Arc<dyn DeviceClient>, devnode: Option<PathBuf>) -> io::Result<HotplugMonitor> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(String::from("drm_hotplug"))
            .spawn(move || {
                let span = info_span!("udev", devnode = ?devnode);
                let _guard = span.enter();

                let socket = match MonitorBuilder::new()
                    .and_then(|builder| builder.match_subsystem("drm"))
                    .and_then(|builder| builder.listen())
                {
                    Ok(socket) => {
                        let _ = ready_tx.send(Ok(()));
                        socket
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                info!("Monitoring drm hotplug events");

                while !thread_stop.load(Ordering::Acquire) {
                    // SAFETY: the socket outlives the borrow
                    let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
                    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
                    match poll(&mut fds, POLL_TIMEOUT_MS) {
                        Ok(0) => continue,
                        Ok(_) => {}
                        Err(rustix::io::Errno::INTR) => continue,
                        Err(err) => {
                            error!(?err, "Polling the udev monitor failed, stopping");
                            return;
                        }
                    }

                    let mut changed = false;
                    for event in socket.iter() {
                        if event.event_type() != EventType::Change {
                            continue;
                        }
                        if let (Some(wanted), Some(node)) = (devnode.as_deref(), event.devnode()) {
                            if wanted != node {
                                trace!(?node, "Ignoring change of another card");
                                continue;
                            }
                        }
                        changed |= event
                            .property_value("HOTPLUG")
                            .map(|value| value == "1")
                            .unwrap_or(true);
                    }

                    if changed {
                        debug!("Hotplug event");
                        if let Err(err) = client.handle_hotplug() {
                            warn!(?err, "Failed to handle hotplug");
                        }
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(HotplugMonitor {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "hotplug thread exited")),
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Returns the path of the primary card of `seat`, if any
///
/// Cards behind a PCI device marked `boot_vga` take precedence.
pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
    let mut enumerator = Enumerator::new()?;
    enumerator.match_subsystem("drm")?;
    enumerator.match_sysname("card[0-9]*")?;

    let mut result = None;
    for device in enumerator.scan_devices()? {
        if device
            .property_value("ID_SEAT")
            .map(|x| x.to_os_string())
            .unwrap_or_else(|| OsString::from("seat0"))
            == *seat.as_ref()
        {
            if let Some(pci) = device.parent_with_subsystem(Path::new("pci"))? {
                if let Some(id) = pci.attribute_value("boot_vga") {
                    if id == "1" {
                        result = Some(device);
                    }
                }
            } else if result.is_none() {
                result = Some(device);
            }
        }
    }
    Ok(result.and_then(|device| device.devnode().map(PathBuf::from)))
}
