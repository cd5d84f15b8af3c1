//! Client buffers imported as kernel framebuffers

use std::{fmt, sync::Arc};

use tracing::{trace, warn};

use super::{
    device::{FramebufferDesc, FramebufferId, GemHandle, KmsDevice},
    Error,
};
use crate::{
    backend::allocator::{format, ClientBuffer, Fourcc, Modifier},
    utils::{Buffer, Size},
};

/// A client buffer the display engine can scan out
///
/// Owned jointly by the [`BufferCache`](super::BufferCache) and any frame
/// still on screen. Dropping the last reference removes the framebuffer and
/// then releases the imported buffer object.
pub struct HardwareFramebuffer {
    fb: FramebufferId,
    gem: GemHandle,
    format: Fourcc,
    modifier: Modifier,
    size: Size<i32, Buffer>,
    device: Arc<dyn KmsDevice>,
}

impl fmt::Debug for HardwareFramebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareFramebuffer")
            .field("fb", &self.fb)
            .field("gem", &self.gem)
            .field("format", &self.format)
            .field("modifier", &self.modifier)
            .field("size", &self.size)
            .finish()
    }
}

impl HardwareFramebuffer {
    /// Creates a framebuffer for an already imported buffer object
    ///
    /// Takes ownership of `gem`: it is closed again if the framebuffer cannot be created.
    #[profiling::function]
    pub fn create(
        device: &Arc<dyn KmsDevice>,
        gem: GemHandle,
        buffer: &ClientBuffer,
    ) -> Result<HardwareFramebuffer, Error> {
        let num_planes = buffer.num_planes();
        if num_planes == 0 || num_planes > 4 {
            let _ = device.close_gem(gem);
            return Err(Error::UnsupportedBuffer { planes: num_planes });
        }

        let scanout_format = format::scanout_format(buffer.format(), buffer.modifier());
        let modifier = if format::is_explicit_modifier(buffer.modifier()) {
            Some(buffer.modifier())
        } else {
            None
        };

        let mut handles = [None; 4];
        let mut pitches = [0; 4];
        let mut offsets = [0; 4];
        for (i, (stride, offset)) in buffer.strides().zip(buffer.offsets()).enumerate() {
            // every plane of a dma-buf import lives in the same buffer object
            handles[i] = Some(gem);
            pitches[i] = stride;
            offsets[i] = offset;
        }

        let desc = FramebufferDesc {
            width: buffer.width(),
            height: buffer.height(),
            format: scanout_format,
            modifier,
            handles,
            pitches,
            offsets,
        };
        let fb = match device.add_framebuffer(&desc) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(close_err) = device.close_gem(gem) {
                    warn!(?gem, "Failed to close buffer object: {}", close_err);
                }
                return Err(err);
            }
        };
        trace!(?fb, ?gem, format = ?scanout_format, "Created framebuffer");

        Ok(HardwareFramebuffer {
            fb,
            gem,
            format: scanout_format,
            modifier: buffer.modifier(),
            size: buffer.size(),
            device: device.clone(),
        })
    }

    /// Kernel framebuffer id
    #[inline]
    pub fn id(&self) -> FramebufferId {
        self.fb
    }

    /// Import identity of the underlying buffer
    #[inline]
    pub fn gem(&self) -> GemHandle {
        self.gem
    }

    /// Format the framebuffer is scanned out as
    #[inline]
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Layout modifier of the client buffer
    #[inline]
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Size in pixels
    #[inline]
    pub fn size(&self) -> Size<i32, Buffer> {
        self.size
    }
}

impl Drop for HardwareFramebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, gem = ?self.gem, "Releasing framebuffer");
        if let Err(err) = self.device.remove_framebuffer(self.fb) {
            warn!("Failed to destroy framebuffer {:?}: {}", self.fb, err);
        }
        if let Err(err) = self.device.close_gem(self.gem) {
            warn!("Failed to close buffer object {:?}: {}", self.gem, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{
        allocator::{format::DRM_FORMAT_MOD_AMPHION_TILED, test::buffer_with, BufferUsage},
        drm::{device::test::MockDevice, topology::Topology},
    };

    #[test]
    fn tiled_abgr_is_scanned_out_as_argb() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let buffer = buffer_with(
            64,
            32,
            Fourcc::Abgr8888,
            Modifier::from(DRM_FORMAT_MOD_AMPHION_TILED),
            BufferUsage::empty(),
        );
        let gem = device.import_prime(buffer.fd()).unwrap();
        let fb = HardwareFramebuffer::create(&device, gem, &buffer).unwrap();
        assert_eq!(fb.format(), Fourcc::Argb8888);

        let (_, desc) = mock.framebuffers.lock().unwrap()[0].clone();
        assert_eq!(desc.modifier, Some(Modifier::from(DRM_FORMAT_MOD_AMPHION_TILED)));
        assert_eq!(desc.pitches[0], 256);
        assert_eq!(desc.handles[0], Some(gem));
    }

    #[test]
    fn drop_removes_framebuffer_then_closes_gem() {
        let mock = Arc::new(MockDevice::new(Topology::default()));
        let device: Arc<dyn KmsDevice> = mock.clone();
        let buffer = buffer_with(16, 16, Fourcc::Xrgb8888, Modifier::Linear, BufferUsage::empty());
        let gem = device.import_prime(buffer.fd()).unwrap();
        let fb = HardwareFramebuffer::create(&device, gem, &buffer).unwrap();
        let (_, desc) = mock.framebuffers.lock().unwrap()[0].clone();
        assert_eq!(desc.modifier, None);

        let id = fb.id();
        drop(fb);
        assert_eq!(*mock.removed.lock().unwrap(), vec![id]);
        assert_eq!(*mock.closed.lock().unwrap(), vec![gem]);
    }
}
