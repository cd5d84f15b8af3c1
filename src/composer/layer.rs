//! Layers: the visual surfaces a client submits for one display

use std::{cmp::Ordering, fmt, sync::Arc};

use crate::{
    backend::{allocator::ClientBuffer, sync::Fence, HdrMetadata, PerFrameMetadataKey},
    utils::{ids::id_gen, Buffer, Display, Rectangle, Transform},
};

use super::Error;

id_gen!(layer_ids);

/// Stable identifier of a [`Layer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    /// Raw value handed across the client boundary
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Reconstructs an id received from a client
    #[inline]
    pub fn from_raw(raw: u64) -> LayerId {
        LayerId(raw)
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produces the final pixels of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Composition {
    /// The client renders the layer into the client target
    Client,
    /// The engine shows the layer, on a plane or through the blit engine
    Device,
    /// The engine fills the layer with a constant color
    SolidColor,
    /// Cursor layer, may reserve a plane of its own
    Cursor,
    /// Buffer stream attached out of band
    Sideband,
}

/// How a layer blends with the content below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    /// Opaque, no blending
    None,
    /// Source color is premultiplied by alpha
    #[default]
    Premultiplied,
    /// Source color is not premultiplied
    Coverage,
}

/// RGBA color with components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    /// red
    pub r: f32,
    /// green
    pub g: f32,
    /// blue
    pub b: f32,
    /// alpha
    pub a: f32,
}

impl Color {
    /// Packs the color as `0xAABBGGRR`
    pub fn to_abgr8888(self) -> u32 {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
        (c(self.a) << 24) | (c(self.b) << 16) | (c(self.g) << 8) | c(self.r)
    }
}

/// Per-frame state of a layer, without its acquire fence
///
/// This is what validation operates on; it can be snapshotted freely.
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Stable identifier
    pub id: LayerId,
    /// Stacking order, larger values are further on top
    pub z: u32,
    /// Requested composition
    pub composition: Composition,
    /// Region of the buffer to show
    pub source_crop: Rectangle<f64, Buffer>,
    /// Region of the display to cover
    pub display_frame: Rectangle<i32, Display>,
    /// Visible parts of the display frame
    pub visible_region: Vec<Rectangle<i32, Display>>,
    /// Blend mode
    pub blend: BlendMode,
    /// Global alpha applied to the whole layer
    pub plane_alpha: f32,
    /// Transform applied to the buffer
    pub transform: Transform,
    /// Fill color of solid-color layers
    pub color: Color,
    /// Currently attached buffer
    pub buffer: Option<Arc<ClientBuffer>>,
    /// Static HDR metadata attached to the layer
    pub hdr_metadata: Option<HdrMetadata>,
}

impl LayerState {
    /// Returns true if the layer has a buffer whose format the display controller has to read
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Effective visible region: the display frame clipped to the visible rects
    pub fn visible_rects(&self) -> Vec<Rectangle<i32, Display>> {
        if self.visible_region.is_empty() {
            return vec![self.display_frame];
        }
        self.visible_region
            .iter()
            .filter_map(|rect| rect.intersection(self.display_frame))
            .collect()
    }
}

/// Total order used for composition: z-order, then stable id
pub fn z_order(a: &LayerState, b: &LayerState) -> Ordering {
    a.z.cmp(&b.z).then(a.id.cmp(&b.id))
}

/// A layer owned by a display
#[derive(Debug)]
pub struct Layer {
    state: LayerState,
    acquire_fence: Option<Fence>,
}

impl Layer {
    pub(crate) fn new() -> Layer {
        Layer {
            state: LayerState {
                id: LayerId(layer_ids::next()),
                z: 0,
                composition: Composition::Device,
                source_crop: Rectangle::default(),
                display_frame: Rectangle::default(),
                visible_region: Vec::new(),
                blend: BlendMode::default(),
                plane_alpha: 1.0,
                transform: Transform::empty(),
                color: Color::default(),
                buffer: None,
                hdr_metadata: None,
            },
            acquire_fence: None,
        }
    }

    /// Identifier of the layer
    #[inline]
    pub fn id(&self) -> LayerId {
        self.state.id
    }

    /// Current state of the layer
    #[inline]
    pub fn state(&self) -> &LayerState {
        &self.state
    }

    /// Attach a buffer and the fence signaling when it may be read
    pub fn set_buffer(&mut self, buffer: Option<Arc<ClientBuffer>>, acquire_fence: Option<Fence>) {
        self.state.buffer = buffer;
        self.acquire_fence = acquire_fence;
    }

    /// Set the requested composition type
    pub fn set_composition(&mut self, composition: Composition) {
        self.state.composition = composition;
    }

    /// Set the source crop in buffer coordinates
    pub fn set_source_crop(&mut self, crop: Rectangle<f64, Buffer>) {
        self.state.source_crop = crop;
    }

    /// Set the destination on the display
    pub fn set_display_frame(&mut self, frame: Rectangle<i32, Display>) {
        self.state.display_frame = frame;
    }

    /// Set the visible region
    pub fn set_visible_region(&mut self, region: Vec<Rectangle<i32, Display>>) {
        self.state.visible_region = region;
    }

    /// Set the blend mode
    pub fn set_blend_mode(&mut self, blend: BlendMode) {
        self.state.blend = blend;
    }

    /// Set the plane alpha, must be within `0.0..=1.0`
    pub fn set_plane_alpha(&mut self, alpha: f32) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::BadParameter("plane alpha out of range"));
        }
        self.state.plane_alpha = alpha;
        Ok(())
    }

    /// Set the buffer transform
    pub fn set_transform(&mut self, transform: Transform) {
        self.state.transform = transform;
    }

    /// Set the stacking order
    pub fn set_z_order(&mut self, z: u32) {
        self.state.z = z;
    }

    /// Set the fill color of a solid-color layer
    pub fn set_color(&mut self, color: Color) {
        self.state.color = color;
    }

    /// Merge per-frame HDR metadata into the static metadata of the layer
    pub fn set_per_frame_metadata(&mut self, metadata: &[(PerFrameMetadataKey, f32)]) {
        let hdr = self.state.hdr_metadata.get_or_insert_with(HdrMetadata::default);
        for (key, value) in metadata {
            hdr.set(*key, *value);
        }
    }

    pub(crate) fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }
}

impl Drop for Layer {
    fn drop(&mut self) {
        layer_ids::remove(self.state.id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Layer::new();
        let b = Layer::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn order_breaks_ties_by_id() {
        let mut a = Layer::new();
        let mut b = Layer::new();
        a.set_z_order(3);
        b.set_z_order(3);
        let expected = a.id().cmp(&b.id());
        assert_eq!(z_order(a.state(), b.state()), expected);
        b.set_z_order(1);
        assert_eq!(z_order(a.state(), b.state()), Ordering::Greater);
    }

    #[test]
    fn plane_alpha_is_checked() {
        let mut layer = Layer::new();
        assert!(matches!(layer.set_plane_alpha(1.5), Err(Error::BadParameter(_))));
        layer.set_plane_alpha(0.5).unwrap();
        assert_eq!(layer.state().plane_alpha, 0.5);
    }

    #[test]
    fn visible_rects_are_clipped_to_frame() {
        let mut layer = Layer::new();
        layer.set_display_frame(Rectangle::from_ltrb(0, 0, 100, 100));
        assert_eq!(layer.state().visible_rects(), vec![Rectangle::from_ltrb(0, 0, 100, 100)]);
        layer.set_visible_region(vec![
            Rectangle::from_ltrb(50, 50, 150, 150),
            Rectangle::from_ltrb(200, 200, 300, 300),
        ]);
        assert_eq!(
            layer.state().visible_rects(),
            vec![Rectangle::from_ltrb(50, 50, 100, 100)]
        );
    }

    #[test]
    fn solid_color_packing() {
        let color = Color {
            r: 1.0,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        };
        assert_eq!(color.to_abgr8888(), 0xff00_00ff);
    }
}
