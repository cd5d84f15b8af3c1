//! [`BlitEngine`] backed by the vendor `libg2d` library
//!
//! The library is loaded at runtime, `libg2d-<suffix>.so` when a vendor suffix
//! is configured and `libg2d.so` otherwise.

use std::{
    ffi::{c_int, c_long, c_void},
    fmt,
    os::unix::io::{FromRawFd, OwnedFd},
    ptr,
    sync::Arc,
};

use libloading::Library;
use tracing::{debug, info, info_span, warn};

use super::{
    BlendFunc, BlitCap, BlitEngine, BlitFeatures, BlitTarget, Error, Rotation, Surface, SurfaceFormat,
    Tiling,
};
use crate::{
    backend::allocator::{format::get_bpp, BufferUsage, ClientBuffer, Fourcc, Modifier},
    utils::{Display, Rectangle, Size},
};

#[allow(non_camel_case_types)]
mod ffi {
    use std::ffi::{c_int, c_long, c_void};

    pub const G2D_RGB565: c_int = 0;
    pub const G2D_RGBA8888: c_int = 1;
    pub const G2D_RGBX8888: c_int = 2;
    pub const G2D_BGRA8888: c_int = 3;
    pub const G2D_BGRX8888: c_int = 4;
    pub const G2D_NV12: c_int = 20;
    pub const G2D_I420: c_int = 21;
    pub const G2D_YV12: c_int = 22;
    pub const G2D_NV21: c_int = 23;
    pub const G2D_YUYV: c_int = 24;
    pub const G2D_NV16: c_int = 28;

    pub const G2D_ZERO: c_int = 0;
    pub const G2D_ONE: c_int = 1;
    pub const G2D_SRC_ALPHA: c_int = 2;
    pub const G2D_ONE_MINUS_SRC_ALPHA: c_int = 3;

    pub const G2D_BLEND: c_int = 0;
    pub const G2D_DITHER: c_int = 1;
    pub const G2D_GLOBAL_ALPHA: c_int = 2;

    pub const G2D_ROTATION: c_int = 1;
    pub const G2D_FAST_CLEAR: c_int = 5;

    pub const G2D_ROTATION_0: c_int = 0;
    pub const G2D_ROTATION_90: c_int = 1;
    pub const G2D_ROTATION_180: c_int = 2;
    pub const G2D_ROTATION_270: c_int = 3;
    pub const G2D_FLIP_H: c_int = 4;
    pub const G2D_FLIP_V: c_int = 5;

    pub const G2D_LINEAR: c_int = 0x1;
    pub const G2D_AMPHION_TILED: c_int = 0x8;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct g2d_surface {
        pub format: c_int,
        pub planes: [c_long; 3],
        pub left: c_int,
        pub top: c_int,
        pub right: c_int,
        pub bottom: c_int,
        pub stride: c_int,
        pub width: c_int,
        pub height: c_int,
        pub blendfunc: c_int,
        pub global_alpha: c_int,
        pub clrcolor: c_int,
        pub rot: c_int,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct g2d_surfaceEx {
        pub base: g2d_surface,
        pub tiling: c_int,
    }

    #[repr(C)]
    #[derive(Debug)]
    pub struct g2d_buf {
        pub buf_handle: *mut c_void,
        pub buf_vaddr: *mut c_void,
        pub buf_paddr: c_long,
        pub buf_size: c_int,
    }

    pub type Open = unsafe extern "C" fn(*mut *mut c_void) -> c_int;
    pub type Close = unsafe extern "C" fn(*mut c_void) -> c_int;
    pub type Clear = unsafe extern "C" fn(*mut c_void, *mut g2d_surface) -> c_int;
    pub type Blit = unsafe extern "C" fn(*mut c_void, *mut g2d_surface, *mut g2d_surface) -> c_int;
    pub type BlitEx = unsafe extern "C" fn(*mut c_void, *mut g2d_surfaceEx, *mut g2d_surfaceEx) -> c_int;
    pub type Toggle = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
    pub type Finish = unsafe extern "C" fn(*mut c_void) -> c_int;
    pub type QueryFeature = unsafe extern "C" fn(*mut c_void, c_int, *mut c_int) -> c_int;
    pub type SetClipping = unsafe extern "C" fn(*mut c_void, c_int, c_int, c_int, c_int) -> c_int;
    pub type Alloc = unsafe extern "C" fn(c_int, c_int) -> *mut g2d_buf;
    pub type Free = unsafe extern "C" fn(*mut g2d_buf) -> c_int;
    pub type ExportFd = unsafe extern "C" fn(*mut g2d_buf) -> c_int;
}

struct Functions {
    open: ffi::Open,
    close: ffi::Close,
    clear: ffi::Clear,
    blit: ffi::Blit,
    blit_ex: Option<ffi::BlitEx>,
    enable: ffi::Toggle,
    disable: ffi::Toggle,
    finish: ffi::Finish,
    query_feature: Option<ffi::QueryFeature>,
    set_clipping: ffi::SetClipping,
    alloc: ffi::Alloc,
    free: ffi::Free,
    export_fd: ffi::ExportFd,
}

impl Functions {
    /// # Safety
    ///
    /// The library must export the g2d API with the signatures declared in [`ffi`].
    unsafe fn load(lib: &Library, name: &str) -> Result<Functions, Error> {
        macro_rules! sym {
            ($ty:ty, $sym:literal) => {
                *lib.get::<$ty>($sym).map_err(|err| Error::Library {
                    name: format!("{} ({})", name, String::from_utf8_lossy(&$sym[..$sym.len() - 1])),
                    source: Box::new(err),
                })?
            };
        }
        macro_rules! optional {
            ($ty:ty, $sym:literal) => {
                lib.get::<$ty>($sym).ok().map(|sym| *sym)
            };
        }

        Ok(Functions {
            open: sym!(ffi::Open, b"g2d_open\0"),
            close: sym!(ffi::Close, b"g2d_close\0"),
            clear: sym!(ffi::Clear, b"g2d_clear\0"),
            blit: sym!(ffi::Blit, b"g2d_blit\0"),
            blit_ex: optional!(ffi::BlitEx, b"g2d_blitEx\0"),
            enable: sym!(ffi::Toggle, b"g2d_enable\0"),
            disable: sym!(ffi::Toggle, b"g2d_disable\0"),
            finish: sym!(ffi::Finish, b"g2d_finish\0"),
            query_feature: optional!(ffi::QueryFeature, b"g2d_query_feature\0"),
            set_clipping: sym!(ffi::SetClipping, b"g2d_set_clipping\0"),
            alloc: sym!(ffi::Alloc, b"g2d_alloc\0"),
            free: sym!(ffi::Free, b"g2d_free\0"),
            export_fd: sym!(ffi::ExportFd, b"g2d_buf_export_fd\0"),
        })
    }
}

/// An open g2d context
pub struct G2dEngine {
    fns: Functions,
    handle: *mut c_void,
    features: BlitFeatures,
    name: String,
    span: tracing::Span,
    // keeps the function pointers valid, dropped last
    _lib: Library,
}

// The context is only ever used by one thread at a time, guarded by `BlitComposer`.
unsafe impl Send for G2dEngine {}

impl fmt::Debug for G2dEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("G2dEngine")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

/// File name of the vendor library
pub fn library_name(suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) if !suffix.is_empty() => format!("libg2d-{}.so", suffix),
        _ => String::from("libg2d.so"),
    }
}

impl G2dEngine {
    /// Load the library and open a context
    pub fn open(suffix: Option<&str>) -> Result<G2dEngine, Error> {
        let name = library_name(suffix);
        let span = info_span!("g2d", library = %name);
        let _guard = span.enter();

        let lib = unsafe { Library::new(&name) }.map_err(|err| Error::Library {
            name: name.clone(),
            source: Box::new(err),
        })?;
        let fns = unsafe { Functions::load(&lib, &name)? };

        let mut handle = ptr::null_mut();
        let code = unsafe { (fns.open)(&mut handle) };
        if code != 0 || handle.is_null() {
            return Err(Error::Call { op: "g2d_open", code });
        }
        let handle = scopeguard::guard(handle, |handle| unsafe {
            (fns.close)(handle);
        });

        let query = |feature| {
            let Some(query_feature) = fns.query_feature else {
                return false;
            };
            let mut enabled: c_int = 0;
            unsafe { query_feature(*handle, feature, &mut enabled) };
            enabled != 0
        };
        let mut features = BlitFeatures::empty();
        features.set(BlitFeatures::ROTATION, query(ffi::G2D_ROTATION));
        features.set(BlitFeatures::FAST_CLEAR, query(ffi::G2D_FAST_CLEAR));
        if fns.blit_ex.is_none() {
            debug!("g2d_blitEx missing, tiled sources are not supported");
        }

        let handle = scopeguard::ScopeGuard::into_inner(handle);
        info!(?features, "Opened blit engine");
        drop(_guard);
        Ok(G2dEngine {
            fns,
            handle,
            features,
            name,
            span,
            _lib: lib,
        })
    }

    fn check(op: &'static str, code: c_int) -> Result<(), Error> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Call { op, code })
        }
    }
}

fn to_ffi(surface: &Surface) -> ffi::g2d_surfaceEx {
    let format = match surface.format {
        SurfaceFormat::Rgb565 => ffi::G2D_RGB565,
        SurfaceFormat::Rgba8888 => ffi::G2D_RGBA8888,
        SurfaceFormat::Rgbx8888 => ffi::G2D_RGBX8888,
        SurfaceFormat::Bgra8888 => ffi::G2D_BGRA8888,
        SurfaceFormat::Bgrx8888 => ffi::G2D_BGRX8888,
        SurfaceFormat::Nv12 => ffi::G2D_NV12,
        SurfaceFormat::Nv21 => ffi::G2D_NV21,
        SurfaceFormat::Nv16 => ffi::G2D_NV16,
        SurfaceFormat::I420 => ffi::G2D_I420,
        SurfaceFormat::Yv12 => ffi::G2D_YV12,
        SurfaceFormat::Yuyv => ffi::G2D_YUYV,
    };
    let blendfunc = match surface.blend {
        BlendFunc::Zero => ffi::G2D_ZERO,
        BlendFunc::One => ffi::G2D_ONE,
        BlendFunc::SrcAlpha => ffi::G2D_SRC_ALPHA,
        BlendFunc::OneMinusSrcAlpha => ffi::G2D_ONE_MINUS_SRC_ALPHA,
    };
    let rot = match surface.rotation {
        Rotation::Rot0 => ffi::G2D_ROTATION_0,
        Rotation::Rot90 => ffi::G2D_ROTATION_90,
        Rotation::Rot180 => ffi::G2D_ROTATION_180,
        Rotation::Rot270 => ffi::G2D_ROTATION_270,
        Rotation::FlipH => ffi::G2D_FLIP_H,
        Rotation::FlipV => ffi::G2D_FLIP_V,
    };
    ffi::g2d_surfaceEx {
        base: ffi::g2d_surface {
            format,
            planes: surface.planes.map(|addr| addr as c_long),
            left: surface.rect.left(),
            top: surface.rect.top(),
            right: surface.rect.right(),
            bottom: surface.rect.bottom(),
            stride: surface.stride,
            width: surface.size.w,
            height: surface.size.h,
            blendfunc,
            global_alpha: c_int::from(surface.global_alpha),
            clrcolor: surface.clear_color as c_int,
            rot,
        },
        tiling: match surface.tiling {
            Tiling::Linear => ffi::G2D_LINEAR,
            Tiling::AmphionTiled => ffi::G2D_AMPHION_TILED,
        },
    }
}

fn cap(cap: BlitCap) -> c_int {
    match cap {
        BlitCap::Blend => ffi::G2D_BLEND,
        BlitCap::Dither => ffi::G2D_DITHER,
        BlitCap::GlobalAlpha => ffi::G2D_GLOBAL_ALPHA,
    }
}

impl BlitEngine for G2dEngine {
    fn features(&self) -> BlitFeatures {
        self.features
    }

    fn clear(&mut self, surface: &Surface) -> Result<(), Error> {
        let mut raw = to_ffi(surface);
        Self::check("g2d_clear", unsafe { (self.fns.clear)(self.handle, &mut raw.base) })
    }

    fn set_clipping(&mut self, clip: Rectangle<i32, Display>) -> Result<(), Error> {
        Self::check("g2d_set_clipping", unsafe {
            (self.fns.set_clipping)(self.handle, clip.left(), clip.top(), clip.right(), clip.bottom())
        })
    }

    fn blit(&mut self, src: &Surface, dst: &Surface) -> Result<(), Error> {
        let mut src = to_ffi(src);
        let mut dst = to_ffi(dst);
        match self.fns.blit_ex {
            Some(blit_ex) => Self::check("g2d_blitEx", unsafe { blit_ex(self.handle, &mut src, &mut dst) }),
            None => Self::check("g2d_blit", unsafe {
                (self.fns.blit)(self.handle, &mut src.base, &mut dst.base)
            }),
        }
    }

    fn enable(&mut self, which: BlitCap) -> Result<(), Error> {
        Self::check("g2d_enable", unsafe { (self.fns.enable)(self.handle, cap(which)) })
    }

    fn disable(&mut self, which: BlitCap) -> Result<(), Error> {
        Self::check("g2d_disable", unsafe { (self.fns.disable)(self.handle, cap(which)) })
    }

    fn finish(&mut self) -> Result<(), Error> {
        Self::check("g2d_finish", unsafe { (self.fns.finish)(self.handle) })
    }

    fn alloc_target(
        &mut self,
        size: Size<i32, Display>,
        format: Fourcc,
        secure: bool,
    ) -> Result<BlitTarget, Error> {
        let _guard = self.span.enter();
        let failed = || Error::Allocation {
            width: size.w,
            height: size.h,
        };
        let bpp = get_bpp(format).unwrap_or(32) as i32;
        let stride = size.w * bpp / 8;
        let bytes = stride.checked_mul(size.h).ok_or_else(failed)?;

        let buf = unsafe { (self.fns.alloc)(bytes, 0) };
        if buf.is_null() {
            return Err(failed());
        }
        let buf = scopeguard::guard(buf, |buf| unsafe {
            (self.fns.free)(buf);
        });

        let fd = unsafe { (self.fns.export_fd)(*buf) };
        if fd < 0 {
            return Err(Error::Call {
                op: "g2d_buf_export_fd",
                code: fd,
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let paddr = unsafe { (**buf).buf_paddr } as u64;

        let mut usage = BufferUsage::SCANOUT;
        if secure {
            usage |= BufferUsage::SECURE | BufferUsage::PROTECTED;
        }
        let mut builder = ClientBuffer::builder((size.w, size.h), format, Modifier::Linear)
            .usage(usage)
            .physical_address(paddr);
        builder.add_plane(fd, 0, stride as u32);
        let buffer = builder.build().ok_or_else(failed)?;

        let buf = scopeguard::ScopeGuard::into_inner(buf);
        debug!(?size, ?format, secure, "Allocated composer target");
        Ok(BlitTarget {
            buffer: Arc::new(buffer),
            handle: buf as u64,
        })
    }

    fn free_target(&mut self, target: BlitTarget) {
        let code = unsafe { (self.fns.free)(target.handle as *mut ffi::g2d_buf) };
        if code != 0 {
            warn!(parent: &self.span, code, "Failed to free composer target");
        }
    }
}

impl Drop for G2dEngine {
    fn drop(&mut self) {
        unsafe {
            (self.fns.close)(self.handle);
        }
    }
}
