//! Plane allocation and composition strategy
//!
//! [`allocate`] partitions the z-ordered layers of one frame between overlay
//! planes and a single blended path shown on the primary plane. It is a pure
//! function of its inputs: the same layers and the same plane model always
//! produce the same [`Plan`].
//!
//! The pass is greedy and first-fit by ascending z-order:
//!
//! - a single cursor layer that does not cover the screen gets a plane of its
//!   own before anything else is looked at,
//! - every other layer takes the first free plane that can read its buffer,
//!   unless it overlaps a layer already routed to the blended path,
//! - the blended path goes to the blit engine if it can draw all of it, and
//!   back to the client otherwise. A lone layer that the primary plane can
//!   scan out as-is skips blending altogether.

use tracing::{debug, trace};

use crate::{
    backend::{blit::BlitComposer, PlaneId, PlaneInfo},
    utils::{Display, Rectangle, Size},
};

use super::layer::{Composition, LayerId, LayerState};

/// Where a layer's pixels come from this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Scanned out by an overlay plane
    Overlay(PlaneId),
    /// Blended by the blit engine into the primary plane target
    Blit,
    /// Rendered by the client into the client target
    Client,
    /// Scanned out as-is by the primary plane
    Passthrough,
}

/// Hardware view of a display during validation
#[derive(Debug, Clone, Copy)]
pub struct PlaneModel<'a> {
    /// Layers may use overlay planes at all
    pub overlay_supported: bool,
    /// Overlay planes, lowest z first
    pub overlays: &'a [PlaneInfo],
    /// Plane showing the blended result
    pub primary: Option<&'a PlaneInfo>,
}

/// Inputs of one allocation pass besides the layers
#[derive(Clone, Copy)]
pub struct Strategy<'a> {
    /// Size of the display in config coordinates
    pub screen: Size<i32, Display>,
    /// Available planes
    pub planes: PlaneModel<'a>,
    /// Hardware specific overlay restrictions of a layer
    pub overlay_check: &'a dyn Fn(&LayerState) -> bool,
    /// The blit engine, if one is present and enabled
    pub blit: Option<&'a BlitComposer>,
    /// A color transform is active on the display
    pub color_transform: bool,
    /// The link is protected, protected buffers may be scanned out
    pub secure: bool,
}

impl std::fmt::Debug for Strategy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("screen", &self.screen)
            .field("planes", &self.planes)
            .field("blit", &self.blit.is_some())
            .field("color_transform", &self.color_transform)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// Result of an allocation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    routes: Vec<(LayerId, Route)>,
    changes: Vec<(LayerId, Composition)>,
}

impl Plan {
    /// Route of every layer, in z-order
    pub fn routes(&self) -> &[(LayerId, Route)] {
        &self.routes
    }

    /// Route of a single layer
    pub fn route(&self, layer: LayerId) -> Option<Route> {
        self.routes
            .iter()
            .find(|(id, _)| *id == layer)
            .map(|(_, route)| *route)
    }

    /// Composition types the client has to adopt
    pub fn changes(&self) -> &[(LayerId, Composition)] {
        &self.changes
    }

    /// Layers bound to overlay planes, in z-order
    pub fn overlays(&self) -> impl Iterator<Item = (LayerId, PlaneId)> + '_ {
        self.routes.iter().filter_map(|(id, route)| match route {
            Route::Overlay(plane) => Some((*id, *plane)),
            _ => None,
        })
    }

    /// Layers blended by the blit engine, in z-order
    pub fn blit_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.routes
            .iter()
            .filter(|(_, route)| *route == Route::Blit)
            .map(|(id, _)| *id)
    }

    /// The layer scanned out directly by the primary plane
    pub fn passthrough(&self) -> Option<LayerId> {
        self.routes
            .iter()
            .find(|(_, route)| *route == Route::Passthrough)
            .map(|(id, _)| *id)
    }

    /// Whether the frame needs the client target
    pub fn needs_client_target(&self) -> bool {
        self.routes.iter().any(|(_, route)| *route == Route::Client)
    }
}

/// Partition `layers` between planes and the blended path
///
/// `layers` must already be sorted with [`z_order`](super::layer::z_order).
pub fn allocate(strategy: &Strategy<'_>, layers: &[LayerState]) -> Plan {
    let screen = Rectangle::from_size(strategy.screen);
    let mut free: Vec<&PlaneInfo> = if strategy.planes.overlay_supported {
        strategy.planes.overlays.iter().collect()
    } else {
        Vec::new()
    };
    let mut routes: Vec<(LayerId, Route)> = Vec::with_capacity(layers.len());

    let cursor = reserve_cursor_plane(strategy, layers, screen, &mut free);
    if let Some((layer, plane)) = cursor {
        debug!(%layer, ?plane, "Reserved plane for cursor");
    }

    let mut covered: Option<Rectangle<i32, Display>> = None;
    let mut skipped = false;
    let mut blended: Vec<&LayerState> = Vec::new();
    for layer in layers {
        if let Some((id, plane)) = cursor {
            if id == layer.id {
                routes.push((id, Route::Overlay(plane)));
                continue;
            }
        }

        if !skipped && overlay_candidate(layer) {
            let overlaps = covered
                .map(|mask| mask.overlaps(layer.display_frame))
                .unwrap_or(false);
            if !overlaps {
                if let Some(index) = find_plane(strategy, layer, &free) {
                    let plane = free.remove(index);
                    trace!(layer = %layer.id, plane = ?plane.id, "Layer bound to overlay");
                    routes.push((layer.id, Route::Overlay(plane.id)));
                    continue;
                }
            }
        }

        covered = Some(match covered {
            Some(mask) => mask.merge(layer.display_frame),
            None => layer.display_frame,
        });
        if covered.map(|mask| mask.contains_rect(screen)).unwrap_or(false) {
            skipped = true;
        }
        blended.push(layer);
    }

    let route = blended_route(strategy, &blended, screen);
    for layer in &blended {
        routes.push((layer.id, route));
    }
    // keep z-order, the blended layers were appended last
    routes.sort_by_key(|(id, _)| {
        layers
            .iter()
            .position(|layer| layer.id == *id)
            .unwrap_or(usize::MAX)
    });

    let changes = layers
        .iter()
        .filter_map(|layer| {
            let route = routes.iter().find(|(id, _)| *id == layer.id)?.1;
            let composition = resolved_composition(layer.composition, route);
            (composition != layer.composition).then_some((layer.id, composition))
        })
        .collect::<Vec<_>>();

    debug!(
        layers = layers.len(),
        overlays = routes.iter().filter(|(_, r)| matches!(r, Route::Overlay(_))).count(),
        blended = blended.len(),
        ?route,
        changes = changes.len(),
        "Allocated planes"
    );

    Plan { routes, changes }
}

fn overlay_candidate(layer: &LayerState) -> bool {
    matches!(layer.composition, Composition::Device | Composition::Cursor) && layer.buffer.is_some()
}

fn find_plane(strategy: &Strategy<'_>, layer: &LayerState, free: &[&PlaneInfo]) -> Option<usize> {
    let buffer = layer.buffer.as_ref()?;
    if buffer.is_protected() && !strategy.secure {
        return None;
    }
    if !(strategy.overlay_check)(layer) {
        return None;
    }
    free.iter()
        .position(|plane| plane.supports(buffer.format(), buffer.modifier()))
}

fn reserve_cursor_plane(
    strategy: &Strategy<'_>,
    layers: &[LayerState],
    screen: Rectangle<i32, Display>,
    free: &mut Vec<&PlaneInfo>,
) -> Option<(LayerId, PlaneId)> {
    let mut cursors = layers
        .iter()
        .filter(|layer| layer.composition == Composition::Cursor);
    let cursor = cursors.next()?;
    if cursors.next().is_some() || cursor.display_frame.contains_rect(screen) {
        return None;
    }
    if !overlay_candidate(cursor) {
        return None;
    }

    // the topmost matching plane, cursors stack above everything else
    let buffer = cursor.buffer.as_ref()?;
    if buffer.is_protected() && !strategy.secure {
        return None;
    }
    if !(strategy.overlay_check)(cursor) {
        return None;
    }
    let index = free
        .iter()
        .rposition(|plane| plane.supports(buffer.format(), buffer.modifier()))?;
    let plane = free.remove(index);
    Some((cursor.id, plane.id))
}

fn blended_route(strategy: &Strategy<'_>, blended: &[&LayerState], screen: Rectangle<i32, Display>) -> Route {
    match blended {
        [] => return Route::Client,
        [single] if passthrough_eligible(strategy, single, screen) => return Route::Passthrough,
        _ => {}
    }

    let Some(blit) = strategy.blit else {
        return Route::Client;
    };
    let must = blended.iter().any(|layer| blit.must_compose(layer));
    let device = blended
        .iter()
        .all(|layer| blit.can_compose(layer, strategy.color_transform));
    // a lone device layer is cheaper for the client than a blit of the whole screen
    let lone = blended.len() == 1 && blended[0].composition == Composition::Device;
    if must || (device && !lone) {
        Route::Blit
    } else {
        Route::Client
    }
}

fn passthrough_eligible(strategy: &Strategy<'_>, layer: &LayerState, screen: Rectangle<i32, Display>) -> bool {
    if layer.composition != Composition::Device || !layer.transform.is_empty() {
        return false;
    }
    let (Some(buffer), Some(primary)) = (layer.buffer.as_ref(), strategy.planes.primary) else {
        return false;
    };
    if buffer.is_protected() && !strategy.secure {
        return false;
    }
    if strategy.blit.map(|blit| blit.must_compose(layer)).unwrap_or(false) {
        return false;
    }
    let full_crop = layer.source_crop.loc.x == 0.0
        && layer.source_crop.loc.y == 0.0
        && layer.source_crop.size.w == buffer.width() as f64
        && layer.source_crop.size.h == buffer.height() as f64;
    full_crop
        && layer.display_frame == screen
        && buffer.width() as i32 == screen.size.w
        && buffer.height() as i32 == screen.size.h
        && primary.supports(buffer.format(), buffer.modifier())
}

fn resolved_composition(requested: Composition, route: Route) -> Composition {
    match route {
        Route::Overlay(_) | Route::Passthrough => Composition::Device,
        Route::Blit => match requested {
            Composition::Client | Composition::Cursor => Composition::Device,
            other => other,
        },
        Route::Client => Composition::Client,
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, sync::Arc};

    use super::*;
    use crate::{
        backend::{
            allocator::{test::buffer_with, BufferUsage, Fourcc, Modifier},
            blit::{test::composer, BlitFeatures},
            drm::topology::test::plane,
            PlaneKind,
        },
        composer::layer::{BlendMode, Color},
        utils::Transform,
    };

    fn layer(id: u64, z: u32, frame: Rectangle<i32, Display>, format: Fourcc) -> LayerState {
        LayerState {
            id: LayerId::from_raw(id),
            z,
            composition: Composition::Device,
            source_crop: Rectangle::from_size((frame.size.w as f64, frame.size.h as f64).into()),
            display_frame: frame,
            visible_region: Vec::new(),
            blend: BlendMode::None,
            plane_alpha: 1.0,
            transform: Transform::empty(),
            color: Color::default(),
            buffer: Some(Arc::new(buffer_with(
                frame.size.w,
                frame.size.h,
                format,
                Modifier::Linear,
                BufferUsage::empty(),
            ))),
            hdr_metadata: None,
        }
    }

    fn overlays(count: u32, format: Fourcc) -> Vec<PlaneInfo> {
        (0..count)
            .map(|i| plane(40 + i, PlaneKind::Overlay, 0b1, &[(format, &[])]))
            .collect()
    }

    fn primary() -> PlaneInfo {
        plane(30, PlaneKind::Primary, 0b1, &[(Fourcc::Abgr8888, &[])])
    }

    fn accept_all(_: &LayerState) -> bool {
        true
    }

    fn strategy<'a>(overlays: &'a [PlaneInfo], primary: &'a PlaneInfo) -> Strategy<'a> {
        Strategy {
            screen: (1920, 1080).into(),
            planes: PlaneModel {
                overlay_supported: true,
                overlays,
                primary: Some(primary),
            },
            overlay_check: &accept_all,
            blit: None,
            color_transform: false,
            secure: false,
        }
    }

    fn full() -> Rectangle<i32, Display> {
        Rectangle::from_ltrb(0, 0, 1920, 1080)
    }

    #[test]
    fn fullscreen_layer_takes_an_overlay() {
        let planes = overlays(2, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![layer(1, 0, full(), Fourcc::Nv12)];

        let plan = allocate(&strategy(&planes, &primary), &layers);
        assert!(plan.changes().is_empty());
        assert_eq!(plan.overlays().collect::<Vec<_>>(), vec![(LayerId::from_raw(1), PlaneId(40))]);
        assert!(!plan.needs_client_target());
    }

    #[test]
    fn planes_are_never_shared() {
        let planes = overlays(2, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![
            layer(1, 0, Rectangle::from_ltrb(0, 0, 100, 100), Fourcc::Nv12),
            layer(2, 1, Rectangle::from_ltrb(200, 0, 300, 100), Fourcc::Nv12),
            layer(3, 2, Rectangle::from_ltrb(400, 0, 500, 100), Fourcc::Nv12),
            layer(4, 3, Rectangle::from_ltrb(600, 0, 700, 100), Fourcc::Nv12),
        ];

        let plan = allocate(&strategy(&planes, &primary), &layers);
        let bound = plan.overlays().map(|(_, plane)| plane).collect::<Vec<_>>();
        let unique = bound.iter().collect::<HashSet<_>>();
        assert_eq!(bound.len(), 2);
        assert_eq!(unique.len(), bound.len());
        // earlier z claims first
        assert_eq!(plan.route(LayerId::from_raw(1)), Some(Route::Overlay(PlaneId(40))));
        assert_eq!(plan.route(LayerId::from_raw(2)), Some(Route::Overlay(PlaneId(41))));
        assert_eq!(plan.route(LayerId::from_raw(3)), Some(Route::Client));
        assert_eq!(plan.route(LayerId::from_raw(4)), Some(Route::Client));
        assert_eq!(
            plan.changes(),
            &[
                (LayerId::from_raw(3), Composition::Client),
                (LayerId::from_raw(4), Composition::Client)
            ]
        );
    }

    #[test]
    fn allocation_is_deterministic() {
        let planes = overlays(2, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![
            layer(5, 1, Rectangle::from_ltrb(0, 0, 500, 500), Fourcc::Nv12),
            layer(6, 0, Rectangle::from_ltrb(100, 100, 600, 600), Fourcc::Abgr8888),
            layer(7, 2, Rectangle::from_ltrb(900, 0, 1000, 100), Fourcc::Nv12),
        ];
        let strategy = strategy(&planes, &primary);
        let first = allocate(&strategy, &layers);
        for _ in 0..10 {
            assert_eq!(allocate(&strategy, &layers), first);
        }
    }

    #[test]
    fn contended_plane_goes_to_the_lower_layer() {
        let planes = vec![
            plane(40, PlaneKind::Overlay, 0b1, &[(Fourcc::Nv12, &[])]),
            plane(41, PlaneKind::Overlay, 0b1, &[(Fourcc::Yuyv, &[])]),
        ];
        let primary = primary();
        let layers = vec![
            layer(1, 0, Rectangle::from_ltrb(0, 0, 800, 600), Fourcc::Nv12),
            layer(2, 1, Rectangle::from_ltrb(400, 300, 1200, 900), Fourcc::Nv12),
        ];

        let plan = allocate(&strategy(&planes, &primary), &layers);
        assert_eq!(plan.route(LayerId::from_raw(1)), Some(Route::Overlay(PlaneId(40))));
        assert_eq!(plan.route(LayerId::from_raw(2)), Some(Route::Client));
    }

    #[test]
    fn covered_mask_blocks_overlays_above_blended_layers() {
        let planes = overlays(2, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![
            // rgb layers never reach an overlay
            layer(1, 0, Rectangle::from_ltrb(0, 0, 800, 600), Fourcc::Abgr8888),
            layer(2, 1, Rectangle::from_ltrb(400, 300, 1200, 900), Fourcc::Nv12),
            layer(3, 2, Rectangle::from_ltrb(1500, 0, 1900, 300), Fourcc::Nv12),
        ];
        let no_rgb = |layer: &LayerState| {
            layer
                .buffer
                .as_ref()
                .map(|b| b.format() != Fourcc::Abgr8888)
                .unwrap_or(false)
        };
        let mut strategy = strategy(&planes, &primary);
        strategy.overlay_check = &no_rgb;

        let plan = allocate(&strategy, &layers);
        assert_eq!(plan.route(LayerId::from_raw(1)), Some(Route::Client));
        assert_eq!(plan.route(LayerId::from_raw(2)), Some(Route::Client));
        assert_eq!(plan.route(LayerId::from_raw(3)), Some(Route::Overlay(PlaneId(40))));
    }

    #[test]
    fn blit_takes_the_whole_group_or_nothing() {
        let (blit, _) = composer(BlitFeatures::empty());
        let planes = overlays(0, Fourcc::Nv12);
        let primary = primary();
        let mut layers = vec![
            layer(1, 0, full(), Fourcc::Abgr8888),
            layer(2, 1, Rectangle::from_ltrb(10, 10, 100, 100), Fourcc::Abgr8888),
        ];
        let mut strategy = strategy(&planes, &primary);
        strategy.blit = Some(&blit);

        let plan = allocate(&strategy, &layers);
        assert_eq!(plan.blit_layers().count(), 2);
        assert!(plan.changes().is_empty());

        // a rotation the engine cannot do sends everything back to the client
        layers[1].transform = Transform::ROT_90;
        let plan = allocate(&strategy, &layers);
        assert_eq!(plan.blit_layers().count(), 0);
        assert_eq!(plan.changes().len(), 2);

        strategy.color_transform = true;
        layers[1].transform = Transform::empty();
        let plan = allocate(&strategy, &layers);
        assert!(plan.needs_client_target());
    }

    #[test]
    fn protected_buffers_force_the_blit_engine() {
        let (blit, _) = composer(BlitFeatures::empty());
        let planes = overlays(0, Fourcc::Nv12);
        let primary = primary();
        let mut protected = layer(1, 0, full(), Fourcc::Abgr8888);
        protected.buffer = Some(Arc::new(buffer_with(
            1920,
            1080,
            Fourcc::Abgr8888,
            Modifier::Linear,
            BufferUsage::PROTECTED,
        )));
        let mut client = layer(2, 1, Rectangle::from_ltrb(0, 0, 10, 10), Fourcc::Abgr8888);
        client.composition = Composition::Client;
        let mut strategy = strategy(&planes, &primary);
        strategy.blit = Some(&blit);

        let plan = allocate(&strategy, &[protected, client]);
        assert_eq!(plan.blit_layers().count(), 2);
        assert_eq!(plan.changes(), &[(LayerId::from_raw(2), Composition::Device)]);
    }

    #[test]
    fn single_matching_layer_is_passed_through() {
        let planes = overlays(0, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![layer(1, 0, full(), Fourcc::Abgr8888)];

        let plan = allocate(&strategy(&planes, &primary), &layers);
        assert_eq!(plan.passthrough(), Some(LayerId::from_raw(1)));
        assert!(plan.changes().is_empty());

        // a partial frame cannot be scanned out by the primary plane
        let layers = vec![layer(1, 0, Rectangle::from_ltrb(0, 0, 100, 100), Fourcc::Abgr8888)];
        let plan = allocate(&strategy(&planes, &primary), &layers);
        assert_eq!(plan.passthrough(), None);
        assert_eq!(plan.changes(), &[(LayerId::from_raw(1), Composition::Client)]);
    }

    #[test]
    fn cursor_reserves_the_topmost_plane() {
        let planes = overlays(2, Fourcc::Argb8888);
        let primary = primary();
        let mut cursor = layer(1, 5, Rectangle::from_ltrb(10, 10, 74, 74), Fourcc::Argb8888);
        cursor.composition = Composition::Cursor;
        let layers = vec![
            layer(2, 0, Rectangle::from_ltrb(0, 0, 100, 100), Fourcc::Argb8888),
            layer(3, 1, Rectangle::from_ltrb(500, 0, 600, 100), Fourcc::Argb8888),
            cursor,
        ];

        let plan = allocate(&strategy(&planes, &primary), &layers);
        assert_eq!(plan.route(LayerId::from_raw(1)), Some(Route::Overlay(PlaneId(41))));
        assert_eq!(plan.route(LayerId::from_raw(2)), Some(Route::Overlay(PlaneId(40))));
        assert_eq!(plan.route(LayerId::from_raw(3)), Some(Route::Client));
        assert!(plan
            .changes()
            .contains(&(LayerId::from_raw(1), Composition::Device)));
    }

    #[test]
    fn disabled_overlays_route_everything_to_the_client() {
        let planes = overlays(2, Fourcc::Nv12);
        let primary = primary();
        let layers = vec![
            layer(1, 0, Rectangle::from_ltrb(0, 0, 100, 100), Fourcc::Nv12),
            layer(2, 1, Rectangle::from_ltrb(200, 0, 300, 100), Fourcc::Nv12),
        ];
        let mut strategy = strategy(&planes, &primary);
        strategy.planes.overlay_supported = false;

        let plan = allocate(&strategy, &layers);
        assert_eq!(plan.overlays().count(), 0);
        assert_eq!(plan.changes().len(), 2);
    }
}
