//! Format info tables for the DRM formats the composer handles.
//!
//! ```
//! # use hwcomposer::backend::allocator::Fourcc;
//! # use hwcomposer::backend::allocator::format::{get_bpp, has_alpha, is_yuv};
//! assert!(has_alpha(Fourcc::Abgr8888));
//! assert!(is_yuv(Fourcc::Nv12));
//! assert_eq!(get_bpp(Fourcc::Rgb565), Some(16));
//! ```

use super::{Fourcc, Modifier};

/// Amphion (Hantro G1 post-processor) tiled NV12 layout
pub const DRM_FORMAT_MOD_AMPHION_TILED: u64 = (0x09 << 56) | 1;
/// Verisilicon G1 super-tiled layout
pub const DRM_FORMAT_MOD_VSI_G1_TILED: u64 = (0x0b << 56) | 1;
/// Verisilicon G2 4x4 tiled layout
pub const DRM_FORMAT_MOD_VSI_G2_TILED: u64 = (0x0b << 56) | 2;

/// Broad color model of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorClass {
    /// Packed RGB(A)
    Rgb,
    /// Luma/chroma, packed or planar
    Yuv,
}

macro_rules! format_tables {
    (
        $($fourcc: ident {
            class: $class: ident,
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            planes: $planes: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns the color class of the format, [`None`] for unknown formats.
        pub const fn color_class(fourcc: Fourcc) -> Option<ColorClass> {
            match fourcc {
                $(Fourcc::$fourcc => Some(ColorClass::$class),)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: Fourcc) -> bool {
            match fourcc {
                $(Fourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the first plane of the specified format.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the number of memory planes of the specified format.
        pub const fn plane_count(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($planes),)*
                _ => None,
            }
        }
    };
}

format_tables! {
    Abgr8888 { class: Rgb, alpha: true, bpp: 32, planes: 1 },
    Xbgr8888 { class: Rgb, alpha: false, bpp: 32, planes: 1 },
    Argb8888 { class: Rgb, alpha: true, bpp: 32, planes: 1 },
    Xrgb8888 { class: Rgb, alpha: false, bpp: 32, planes: 1 },
    Rgb565 { class: Rgb, alpha: false, bpp: 16, planes: 1 },
    Bgr888 { class: Rgb, alpha: false, bpp: 24, planes: 1 },
    Abgr2101010 { class: Rgb, alpha: true, bpp: 32, planes: 1 },
    Abgr16161616f { class: Rgb, alpha: true, bpp: 64, planes: 1 },
    Nv12 { class: Yuv, alpha: false, bpp: 8, planes: 2 },
    Nv21 { class: Yuv, alpha: false, bpp: 8, planes: 2 },
    Nv16 { class: Yuv, alpha: false, bpp: 8, planes: 2 },
    P010 { class: Yuv, alpha: false, bpp: 16, planes: 2 },
    Yuyv { class: Yuv, alpha: false, bpp: 16, planes: 1 },
    Yuv420 { class: Yuv, alpha: false, bpp: 8, planes: 3 },
    Yvu420 { class: Yuv, alpha: false, bpp: 8, planes: 3 },
}

/// Returns true for packed RGB formats
#[inline]
pub const fn is_rgb(fourcc: Fourcc) -> bool {
    matches!(color_class(fourcc), Some(ColorClass::Rgb))
}

/// Returns true for luma/chroma formats
#[inline]
pub const fn is_yuv(fourcc: Fourcc) -> bool {
    matches!(color_class(fourcc), Some(ColorClass::Yuv))
}

/// Returns true if the modifier describes an explicit, non-linear layout
#[inline]
pub fn is_explicit_modifier(modifier: Modifier) -> bool {
    !matches!(modifier, Modifier::Linear | Modifier::Invalid)
}

/// Returns true for NV12 in the Amphion tiled layout
#[inline]
pub fn is_amphion_tiled(fourcc: Fourcc, modifier: Modifier) -> bool {
    fourcc == Fourcc::Nv12 && u64::from(modifier) == DRM_FORMAT_MOD_AMPHION_TILED
}

/// Format used when handing a buffer to a scan-out plane
///
/// Tiled ABGR8888 is scanned out as ARGB8888 by the display controller.
#[inline]
pub fn scanout_format(fourcc: Fourcc, modifier: Modifier) -> Fourcc {
    if fourcc == Fourcc::Abgr8888 && is_explicit_modifier(modifier) {
        Fourcc::Argb8888
    } else {
        fourcc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert!(is_rgb(Fourcc::Xrgb8888));
        assert!(!is_rgb(Fourcc::Nv12));
        assert!(is_yuv(Fourcc::Yuv420));
        assert_eq!(plane_count(Fourcc::Yvu420), Some(3));
        assert_eq!(color_class(Fourcc::C8), None);
    }

    #[test]
    fn tiled_abgr_scans_out_as_argb() {
        let tiled = Modifier::from(DRM_FORMAT_MOD_VSI_G2_TILED);
        assert_eq!(scanout_format(Fourcc::Abgr8888, tiled), Fourcc::Argb8888);
        assert_eq!(scanout_format(Fourcc::Abgr8888, Modifier::Linear), Fourcc::Abgr8888);
    }

    #[test]
    fn amphion_detection() {
        let amphion = Modifier::from(DRM_FORMAT_MOD_AMPHION_TILED);
        assert!(is_amphion_tiled(Fourcc::Nv12, amphion));
        assert!(!is_amphion_tiled(Fourcc::Nv21, amphion));
        assert!(!is_amphion_tiled(Fourcc::Nv12, Modifier::Linear));
    }
}
