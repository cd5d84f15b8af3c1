//! 2D blit composition
//!
//! Layers that cannot be scanned out by a plane of their own are blended into
//! an off-screen target by a 2D blit engine, and the target is then shown on
//! the primary plane.
//!
//! [`BlitEngine`] is the boundary to the engine. One engine context serves
//! every display, so [`BlitComposer`] owns it behind a mutex and every
//! composition runs with that lock held from the first clear to the final
//! [`finish`](BlitEngine::finish).
//!
//! A composition proceeds back to front:
//!
//! - the worm hole, the part of the target no opaque layer covers, is
//!   cleared to opaque black,
//! - the bottom-most layer is copied without blending,
//! - every further layer is blitted once per visible rectangle, with its
//!   rotation, blend function and plane alpha applied.
//!
//! Solid-color layers are drawn from a scratch surface filled with their color.

#[cfg(feature = "backend_g2d")]
pub mod g2d;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{debug, info_span, instrument, trace, warn};

use crate::{
    backend::{
        allocator::{
            format::{get_bpp, is_amphion_tiled},
            BufferUsage, ClientBuffer, Fourcc,
        },
        DisplayId,
    },
    composer::layer::{BlendMode, Composition, LayerState},
    utils::{unpoison, Display, Rectangle, Size, Transform},
};

/// Errors of the blit engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No engine is available on this system
    #[error("Blit engine unavailable: {0}")]
    Unavailable(&'static str),
    /// The vendor library could not be loaded
    #[error("Failed to load blit library {name}")]
    Library {
        /// Library that was attempted
        name: String,
        /// Underlying loader error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An engine call returned an error code
    #[error("Blit engine call `{op}` failed with code {code}")]
    Call {
        /// Name of the failed call
        op: &'static str,
        /// Returned code
        code: i32,
    },
    /// A composer target could not be allocated
    #[error("Failed to allocate a {width}x{height} composer target")]
    Allocation {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
    },
    /// The buffer cannot be addressed by the engine
    #[error("Buffer cannot be used by the blit engine: {0}")]
    UnsupportedBuffer(&'static str),
}

bitflags::bitflags! {
    /// Optional hardware features of an engine
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BlitFeatures: u32 {
        /// Rotated and flipped blits
        const ROTATION = 1 << 0;
        /// Accelerated clears
        const FAST_CLEAR = 1 << 1;
    }
}

/// Engine state toggled around individual blits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlitCap {
    /// Blend source onto destination
    Blend,
    /// Dither when reducing color depth
    Dither,
    /// Multiply the source with its global alpha
    GlobalAlpha,
}

/// Pixel layouts understood by the engine
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    Rgb565,
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Bgrx8888,
    Nv12,
    Nv21,
    Nv16,
    I420,
    Yv12,
    Yuyv,
}

impl SurfaceFormat {
    /// Engine layout of a DRM format, RGBA8888 for formats the engine does not know
    pub fn from_fourcc(fourcc: Fourcc) -> SurfaceFormat {
        match fourcc {
            Fourcc::Abgr8888 => SurfaceFormat::Rgba8888,
            Fourcc::Xbgr8888 => SurfaceFormat::Rgbx8888,
            Fourcc::Argb8888 => SurfaceFormat::Bgra8888,
            Fourcc::Xrgb8888 => SurfaceFormat::Bgrx8888,
            Fourcc::Rgb565 => SurfaceFormat::Rgb565,
            Fourcc::Nv12 => SurfaceFormat::Nv12,
            Fourcc::Nv21 => SurfaceFormat::Nv21,
            Fourcc::Nv16 => SurfaceFormat::Nv16,
            Fourcc::Yuv420 => SurfaceFormat::I420,
            Fourcc::Yvu420 => SurfaceFormat::Yv12,
            Fourcc::Yuyv => SurfaceFormat::Yuyv,
            other => {
                warn!(format = ?other, "Format unknown to the blit engine, treating as RGBA8888");
                SurfaceFormat::Rgba8888
            }
        }
    }

    fn is_rgb8888(self) -> bool {
        matches!(
            self,
            SurfaceFormat::Rgba8888 | SurfaceFormat::Rgbx8888 | SurfaceFormat::Bgra8888
        )
    }
}

/// Memory layout of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tiling {
    /// Row-major
    #[default]
    Linear,
    /// Amphion video decoder tiles
    AmphionTiled,
}

/// Rotation or flip applied by a blit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    /// Untransformed
    #[default]
    Rot0,
    /// 90° clockwise
    Rot90,
    /// 180°
    Rot180,
    /// 270° clockwise
    Rot270,
    /// Mirrored horizontally
    FlipH,
    /// Mirrored vertically
    FlipV,
}

/// Blend factor of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFunc {
    /// 0
    Zero,
    /// 1
    #[default]
    One,
    /// Source alpha
    SrcAlpha,
    /// 1 - source alpha
    OneMinusSrcAlpha,
}

/// Description of a region of a buffer, as handed to the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    /// Pixel layout
    pub format: SurfaceFormat,
    /// Memory layout
    pub tiling: Tiling,
    /// Physical address of each plane
    pub planes: [u64; 3],
    /// Region read or written
    pub rect: Rectangle<i32, Display>,
    /// Row length in pixels
    pub stride: i32,
    /// Full buffer size
    pub size: Size<i32, Display>,
    /// Blend factor of this side of the blit
    pub blend: BlendFunc,
    /// Global alpha, `0..=255`
    pub global_alpha: u8,
    /// Clear color as `0xAABBGGRR`
    pub clear_color: u32,
    /// Rotation applied to this side of the blit
    pub rotation: Rotation,
}

impl Surface {
    /// Describes `rect` of `buffer`
    ///
    /// The engine addresses memory physically; buffers without a physical
    /// address cannot be described.
    pub fn from_buffer(buffer: &ClientBuffer, rect: Rectangle<i32, Display>) -> Result<Surface, Error> {
        let base = buffer.physical_address();
        if base == 0 {
            return Err(Error::UnsupportedBuffer("no physical address"));
        }

        let format = SurfaceFormat::from_fourcc(buffer.format());
        let bpp = get_bpp(buffer.format()).unwrap_or(32).max(8) as u32;
        let mut stride = (buffer.stride() * 8 / bpp) as i32;
        let width = buffer.width() as i32;
        let height = buffer.height() as i32;

        let offsets: Vec<u64> = buffer.offsets().map(u64::from).collect();
        let mut planes = [base + offsets[0], 0, 0];
        match format {
            SurfaceFormat::Nv12 | SurfaceFormat::Nv21 | SurfaceFormat::Nv16 => {
                planes[1] = match offsets.get(1) {
                    Some(&offset) if offset != 0 => base + offset,
                    _ => planes[0] + (stride * height) as u64,
                };
            }
            SurfaceFormat::I420 | SurfaceFormat::Yv12 => {
                // chroma rows are half width, aligned to 16
                let chroma_stride = ((width / 2 + 15) / 16 * 16) as u64;
                stride = width;
                planes[1] = planes[0] + (stride * height) as u64;
                planes[2] = planes[1] + chroma_stride * height as u64 / 2;
            }
            _ => {}
        }

        Ok(Surface {
            format,
            tiling: if is_amphion_tiled(buffer.format(), buffer.modifier()) {
                Tiling::AmphionTiled
            } else {
                Tiling::Linear
            },
            planes,
            rect,
            stride,
            size: (width, height).into(),
            blend: BlendFunc::One,
            global_alpha: 0xff,
            clear_color: 0,
            rotation: Rotation::Rot0,
        })
    }
}

/// A buffer allocated by the engine as composition output
#[derive(Debug, Clone)]
pub struct BlitTarget {
    /// The buffer, importable by the display backend
    pub buffer: Arc<ClientBuffer>,
    /// Engine-private handle needed to free the allocation
    pub handle: u64,
}

/// A 2D blit engine context
///
/// All calls on one context are serialized by the caller.
pub trait BlitEngine: Send + fmt::Debug {
    /// Optional features of this engine
    fn features(&self) -> BlitFeatures;

    /// Fill `surface.rect` with `surface.clear_color`
    fn clear(&mut self, surface: &Surface) -> Result<(), Error>;

    /// Restrict following blits to `clip` on the destination
    fn set_clipping(&mut self, clip: Rectangle<i32, Display>) -> Result<(), Error>;

    /// Copy `src.rect` of the source onto `dst.rect` of the destination
    fn blit(&mut self, src: &Surface, dst: &Surface) -> Result<(), Error>;

    /// Turn on an engine state
    fn enable(&mut self, cap: BlitCap) -> Result<(), Error>;

    /// Turn off an engine state
    fn disable(&mut self, cap: BlitCap) -> Result<(), Error>;

    /// Block until every queued operation has completed
    fn finish(&mut self) -> Result<(), Error>;

    /// Allocate an output buffer
    fn alloc_target(&mut self, size: Size<i32, Display>, format: Fourcc, secure: bool)
        -> Result<BlitTarget, Error>;

    /// Release an output buffer allocated by [`alloc_target`](BlitEngine::alloc_target)
    fn free_target(&mut self, target: BlitTarget);
}

/// Output parameters of one composition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSpec {
    /// Size of the display in config coordinates
    pub size: Size<i32, Display>,
    /// Pixel format of the target
    pub format: Fourcc,
    /// Allocate from secure memory
    pub secure: bool,
}

#[derive(Debug)]
struct TargetRing {
    spec: TargetSpec,
    targets: Vec<BlitTarget>,
    next: usize,
}

#[derive(Debug)]
struct EngineState {
    engine: Box<dyn BlitEngine>,
    solid: Option<(TargetSpec, BlitTarget)>,
}

/// Composition of layers into rotating per-display targets with a shared engine
#[derive(Debug)]
pub struct BlitComposer {
    engine: Mutex<EngineState>,
    features: BlitFeatures,
    targets: Mutex<HashMap<DisplayId, TargetRing>>,
    targets_per_display: usize,
    span: tracing::Span,
}

impl BlitComposer {
    /// Take ownership of an engine context
    pub fn new(engine: Box<dyn BlitEngine>, targets_per_display: usize) -> BlitComposer {
        let features = engine.features();
        let span = info_span!("blit", features = ?features);
        BlitComposer {
            engine: Mutex::new(EngineState { engine, solid: None }),
            features,
            targets: Mutex::new(HashMap::new()),
            targets_per_display: targets_per_display.max(1),
            span,
        }
    }

    /// Optional features of the engine
    #[inline]
    pub fn features(&self) -> BlitFeatures {
        self.features
    }

    /// Whether the engine is able to draw this layer
    pub fn can_compose(&self, layer: &LayerState, color_transform: bool) -> bool {
        if layer.composition == Composition::Client || color_transform {
            return false;
        }
        if !layer.transform.is_empty() && !self.features.contains(BlitFeatures::ROTATION) {
            return false;
        }
        if let Some(buffer) = &layer.buffer {
            if buffer.format() == Fourcc::Nv12 && buffer.usage().contains(BufferUsage::FULL_RANGE) {
                return false;
            }
        }
        true
    }

    /// Whether only the engine can read this layer's buffer
    pub fn must_compose(&self, layer: &LayerState) -> bool {
        layer
            .buffer
            .as_ref()
            .map(|buffer| is_amphion_tiled(buffer.format(), buffer.modifier()) || buffer.is_protected())
            .unwrap_or(false)
    }

    /// Blend `layers` into the next target of `display`
    ///
    /// Layers are drawn in slice order, bottom-most first. Acquire fences of
    /// the layers must have been waited on already. The returned buffer is
    /// complete when this returns.
    #[instrument(level = "trace", parent = &self.span, skip(self, layers))]
    #[profiling::function]
    pub fn compose(
        &self,
        display_id: DisplayId,
        spec: TargetSpec,
        layers: &[LayerState],
    ) -> Result<Arc<ClientBuffer>, Error> {
        let mut state = unpoison(self.engine.lock());
        let target = self.next_target(&mut *state.engine, display_id, spec)?;
        let screen = Rectangle::from_size(spec.size);

        clear_worm_hole(&mut *state.engine, &target, screen, layers)?;

        let mut drawn = 0;
        for layer in layers {
            if layer.composition == Composition::Sideband {
                continue;
            }
            if let Err(err) = compose_layer(&mut state, &target, spec, layer, drawn == 0) {
                warn!(layer = %layer.id, ?err, "Failed to compose layer");
                break;
            }
            drawn += 1;
        }

        state.engine.finish()?;
        debug!(display = display_id, layers = drawn, "Composed target");
        Ok(target.buffer)
    }

    /// Release all targets of a display
    pub fn release_targets(&self, display: DisplayId) {
        let ring = unpoison(self.targets.lock()).remove(&display);
        if let Some(ring) = ring {
            let mut state = unpoison(self.engine.lock());
            for target in ring.targets {
                state.engine.free_target(target);
            }
        }
    }

    fn next_target(
        &self,
        engine: &mut dyn BlitEngine,
        display_id: DisplayId,
        spec: TargetSpec,
    ) -> Result<BlitTarget, Error> {
        let mut targets = unpoison(self.targets.lock());
        let stale = targets.get(&display_id).map(|ring| ring.spec != spec).unwrap_or(false);
        if stale {
            if let Some(ring) = targets.remove(&display_id) {
                trace!(display = display_id, "Reallocating composer targets");
                for target in ring.targets {
                    engine.free_target(target);
                }
            }
        }

        let ring = targets.entry(display_id).or_insert_with(|| TargetRing {
            spec,
            targets: Vec::with_capacity(self.targets_per_display),
            next: 0,
        });
        if ring.targets.len() < self.targets_per_display && ring.next == ring.targets.len() {
            let target = engine.alloc_target(spec.size, spec.format, spec.secure)?;
            ring.targets.push(target);
        }
        let target = ring.targets[ring.next].clone();
        ring.next = (ring.next + 1) % self.targets_per_display;
        Ok(target)
    }
}

impl Drop for BlitComposer {
    fn drop(&mut self) {
        let state = self.engine.get_mut().unwrap_or_else(|err| err.into_inner());
        let targets = self.targets.get_mut().unwrap_or_else(|err| err.into_inner());
        for (_, ring) in targets.drain() {
            for target in ring.targets {
                state.engine.free_target(target);
            }
        }
        if let Some((_, solid)) = state.solid.take() {
            state.engine.free_target(solid);
        }
    }
}

fn is_opaque(index: usize, layer: &LayerState) -> bool {
    layer.blend == BlendMode::None
        || (index == 0 && layer.blend == BlendMode::Premultiplied)
        || (index != 0 && layer.composition == Composition::SolidColor && layer.color.a >= 1.0)
}

/// Regions of `screen` not covered by an opaque layer
fn worm_hole(screen: Rectangle<i32, Display>, layers: &[LayerState]) -> Vec<Rectangle<i32, Display>> {
    let opaque = layers
        .iter()
        .enumerate()
        .filter(|(index, layer)| is_opaque(*index, layer))
        .flat_map(|(_, layer)| layer.visible_rects());
    screen.subtract_rects(opaque)
}

fn clear_worm_hole(
    engine: &mut dyn BlitEngine,
    target: &BlitTarget,
    screen: Rectangle<i32, Display>,
    layers: &[LayerState],
) -> Result<(), Error> {
    for hole in worm_hole(screen, layers) {
        if hole.is_empty() {
            continue;
        }
        trace!(?hole, "Clearing worm hole");
        let mut surface = Surface::from_buffer(&target.buffer, hole)?;
        surface.clear_color = 0xff << 24;
        engine.clear(&surface)?;
    }
    Ok(())
}

/// Engine rotation of source and destination for a layer transform
fn rotation(transform: Transform, src: &mut Surface, dst: &mut Surface) {
    dst.rotation = if transform == Transform::empty() {
        Rotation::Rot0
    } else if transform == Transform::ROT_90 {
        Rotation::Rot90
    } else if transform == Transform::ROT_180 {
        Rotation::Rot180
    } else if transform == Transform::ROT_270 {
        Rotation::Rot270
    } else if transform == Transform::FLIP_H {
        Rotation::FlipH
    } else if transform == Transform::FLIP_V {
        Rotation::FlipV
    } else if transform == Transform::FLIP_H | Transform::ROT_90 {
        src.rotation = Rotation::FlipH;
        Rotation::Rot90
    } else if transform == Transform::FLIP_V | Transform::ROT_90 {
        src.rotation = Rotation::FlipV;
        Rotation::Rot90
    } else {
        Rotation::Rot0
    };
}

fn blending(mode: BlendMode, src: &mut Surface, dst: &mut Surface) {
    src.blend = match mode {
        BlendMode::Coverage => BlendFunc::SrcAlpha,
        BlendMode::Premultiplied | BlendMode::None => BlendFunc::One,
    };
    dst.blend = BlendFunc::OneMinusSrcAlpha;
}

fn solid_surface(
    state: &mut EngineState,
    spec: TargetSpec,
    rect: Rectangle<i32, Display>,
    color: u32,
) -> Result<Surface, Error> {
    let scratch = TargetSpec { secure: false, ..spec };
    let stale = state.solid.as_ref().map(|(solid, _)| *solid != scratch).unwrap_or(true);
    if stale {
        if let Some((_, old)) = state.solid.take() {
            state.engine.free_target(old);
        }
        let buffer = state.engine.alloc_target(spec.size, spec.format, false)?;
        state.solid = Some((scratch, buffer));
    }
    let Some((_, solid)) = state.solid.as_ref() else {
        return Err(Error::Allocation {
            width: spec.size.w,
            height: spec.size.h,
        });
    };
    let mut surface = Surface::from_buffer(&solid.buffer, rect)?;
    surface.clear_color = color;
    state.engine.clear(&surface)?;
    surface.clear_color = 0;
    Ok(surface)
}

fn compose_layer(
    state: &mut EngineState,
    target: &BlitTarget,
    spec: TargetSpec,
    layer: &LayerState,
    bypass: bool,
) -> Result<(), Error> {
    let solid = layer.composition == Composition::SolidColor;
    if bypass && solid {
        trace!(layer = %layer.id, "Bottom solid color layer bypassed");
        return Ok(());
    }

    let source = layer.source_crop.to_i32_up();
    let frame = layer.display_frame;
    if (source.is_empty() && !solid) || frame.is_empty() {
        debug!(layer = %layer.id, "Skipping layer with empty crop or frame");
        return Ok(());
    }

    let mut src = match (&layer.buffer, solid) {
        (Some(buffer), false) => Surface::from_buffer(
            buffer,
            Rectangle::from_ltrb(source.left(), source.top(), source.right(), source.bottom()),
        )?,
        (_, true) => solid_surface(state, spec, frame, layer.color.to_abgr8888())?,
        (None, false) => return Err(Error::UnsupportedBuffer("layer has no buffer")),
    };
    let mut dst = Surface::from_buffer(&target.buffer, frame)?;

    let dither = !solid && dst.format == SurfaceFormat::Rgb565 && src.format.is_rgb8888();
    rotation(layer.transform, &mut src, &mut dst);
    let blend = layer.blend != BlendMode::None && !bypass;
    if !bypass {
        blending(layer.blend, &mut src, &mut dst);
    }
    src.global_alpha = (layer.plane_alpha.clamp(0.0, 1.0) * 255.0) as u8;

    let engine = &mut *state.engine;
    for clip in layer.visible_rects() {
        if clip.is_empty() || !clip.overlaps(frame) {
            continue;
        }
        engine.set_clipping(clip)?;

        if blend {
            engine.enable(BlitCap::GlobalAlpha)?;
            engine.enable(BlitCap::Blend)?;
        }
        if dither {
            engine.enable(BlitCap::Dither)?;
        }

        let result = engine.blit(&src, &dst);

        if dither {
            engine.disable(BlitCap::Dither)?;
        }
        if blend {
            engine.disable(BlitCap::Blend)?;
            engine.disable(BlitCap::GlobalAlpha)?;
        }
        result?;
    }
    Ok(())
}
