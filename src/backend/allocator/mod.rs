//! Client buffer descriptions.
//!
//! Clients hand the composer graphics buffers as dma-buf file descriptors plus
//! layout metadata. [`ClientBuffer`] bundles both. Buffers are shared through
//! [`Arc`](std::sync::Arc) between the layer that references them and any
//! in-flight frame.

pub mod format;

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use smallvec::SmallVec;

use crate::utils::{Buffer as BufferCoords, Size};

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc};

/// Maximum amount of planes a client buffer may carry
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Usage flags a client attached to a buffer at allocation time
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Content must only reach the display through a protected path
        const PROTECTED = 1 << 0;
        /// Buffer lives in secure memory
        const SECURE = 1 << 1;
        /// Buffer was allocated for scan-out
        const SCANOUT = 1 << 2;
        /// YUV content uses full range quantization
        const FULL_RANGE = 1 << 3;
    }
}

#[derive(Debug)]
struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

/// A graphics buffer submitted by a client
#[derive(Debug)]
pub struct ClientBuffer {
    planes: SmallVec<[Plane; MAX_PLANES]>,
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    modifier: Modifier,
    usage: BufferUsage,
    phys_addr: u64,
}

/// Builder for [`ClientBuffer`]s
#[derive(Debug)]
pub struct ClientBufferBuilder {
    internal: ClientBuffer,
}

impl ClientBufferBuilder {
    /// Add a plane to the constructed buffer
    ///
    /// Returns `false` once [`MAX_PLANES`] planes were added.
    pub fn add_plane(&mut self, fd: OwnedFd, offset: u32, stride: u32) -> bool {
        if self.internal.planes.len() == MAX_PLANES {
            return false;
        }
        self.internal.planes.push(Plane { fd, offset, stride });
        true
    }

    /// Set the usage flags of the buffer
    pub fn usage(mut self, usage: BufferUsage) -> Self {
        self.internal.usage = usage;
        self
    }

    /// Set the physical (bus) address of the buffer, for engines addressing memory directly
    pub fn physical_address(mut self, addr: u64) -> Self {
        self.internal.phys_addr = addr;
        self
    }

    /// Build the buffer, returning `None` if no plane was added
    pub fn build(self) -> Option<ClientBuffer> {
        if self.internal.planes.is_empty() {
            return None;
        }
        Some(self.internal)
    }
}

impl ClientBuffer {
    /// Create a new buffer builder
    pub fn builder(
        size: impl Into<Size<i32, BufferCoords>>,
        format: Fourcc,
        modifier: Modifier,
    ) -> ClientBufferBuilder {
        ClientBufferBuilder {
            internal: ClientBuffer {
                planes: SmallVec::new(),
                size: size.into(),
                format,
                modifier,
                usage: BufferUsage::empty(),
                phys_addr: 0,
            },
        }
    }

    /// Size of the buffer in pixels
    #[inline]
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    /// Width of the buffer in pixels
    #[inline]
    pub fn width(&self) -> u32 {
        self.size.w.max(0) as u32
    }

    /// Height of the buffer in pixels
    #[inline]
    pub fn height(&self) -> u32 {
        self.size.h.max(0) as u32
    }

    /// Pixel format of the buffer
    #[inline]
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Layout modifier of the buffer
    #[inline]
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Usage flags of the buffer
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Physical address of the first plane, 0 if unknown
    #[inline]
    pub fn physical_address(&self) -> u64 {
        self.phys_addr
    }

    /// Returns true if the buffer holds protected content
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.usage.contains(BufferUsage::PROTECTED)
    }

    /// Amount of planes of the buffer
    #[inline]
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// File descriptors of the planes
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Offsets of the planes
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.offset)
    }

    /// Strides of the planes
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.stride)
    }

    /// Stride of the first plane in bytes
    #[inline]
    pub fn stride(&self) -> u32 {
        self.planes[0].stride
    }

    /// File descriptor of the first plane
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.planes[0].fd.as_fd()
    }
}
