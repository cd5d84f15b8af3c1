//! Static hardware topology of a mode-setting device
//!
//! Discovered once at startup: which scan-out planes exist, which pixel
//! formats and modifiers they read, and which display pipelines (CRTCs) they
//! can feed. Connectors are re-probed on hotplug, everything else is fixed.

use std::collections::HashSet;

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::{
    backend::allocator::{Fourcc, Modifier},
    composer::config::{ConfigId, DisplayConfig, PreferredMode},
};

macro_rules! object_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl From<$name> for u32 {
            #[inline]
            fn from(id: $name) -> u32 {
                id.0
            }
        }
    };
}

object_id!(PlaneId, "Kernel object id of a plane");
object_id!(CrtcId, "Kernel object id of a CRTC");
object_id!(ConnectorId, "Kernel object id of a connector");

/// Role of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// Base plane of a CRTC
    Primary,
    /// Additional plane stacked above the primary one
    Overlay,
    /// Small plane for cursor images
    Cursor,
}

/// A hardware scan-out plane
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneInfo {
    /// Kernel object id
    pub id: PlaneId,
    /// Role
    pub kind: PlaneKind,
    /// Bitmask of CRTC indices the plane can feed
    pub possible_crtcs: u32,
    /// Readable formats, each with its explicit modifiers
    pub formats: IndexMap<Fourcc, SmallVec<[u64; 4]>>,
    /// Stacking position if the driver exposes one
    pub zpos: Option<i64>,
    /// Names of the properties the plane exposes
    pub properties: HashSet<String>,
}

impl PlaneInfo {
    /// Whether the plane can scan out `format` with `modifier`
    ///
    /// Linear and implicit layouts only need the format to be listed.
    pub fn supports(&self, format: Fourcc, modifier: Modifier) -> bool {
        let Some(modifiers) = self.formats.get(&format) else {
            return false;
        };
        match modifier {
            Modifier::Linear | Modifier::Invalid => true,
            modifier => modifiers.contains(&u64::from(modifier)),
        }
    }

    /// Whether the plane can feed the CRTC with the given index
    #[inline]
    pub fn compatible_with(&self, crtc_index: u32) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }

    /// Whether the plane exposes property `name`
    #[inline]
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(name)
    }
}

/// A display pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct CrtcInfo {
    /// Kernel object id
    pub id: CrtcId,
    /// Position in the device's CRTC list, used by bitmasks
    pub index: u32,
    /// Names of the properties the CRTC exposes
    pub properties: HashSet<String>,
}

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorStatus {
    /// A sink is attached
    Connected,
    /// Nothing is attached
    Disconnected,
    /// The driver cannot tell
    Unknown,
}

/// Mode type bit marking the sink's preferred mode
pub const MODE_TYPE_PREFERRED: u32 = 1 << 3;

/// A display timing as reported by the kernel
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModeInfo {
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl ModeInfo {
    /// Refresh rate in Hz derived from the timings, rounded
    pub fn refresh_hz(&self) -> u32 {
        let total = self.htotal as u64 * self.vtotal as u64;
        if total == 0 {
            return self.vrefresh;
        }
        ((self.clock as u64 * 1000 + total / 2) / total) as u32
    }

    /// Whether the sink marked this mode as preferred
    #[inline]
    pub fn is_preferred(&self) -> bool {
        self.mode_type & MODE_TYPE_PREFERRED != 0
    }
}

/// A connector and the sink behind it
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    /// Kernel object id
    pub id: ConnectorId,
    /// Connection state
    pub status: ConnectorStatus,
    /// Interface name, e.g. `HDMI-A`
    pub interface: String,
    /// Physical width in millimeters, 0 if unknown
    pub mm_width: u32,
    /// Physical height in millimeters, 0 if unknown
    pub mm_height: u32,
    /// Modes offered by the sink
    pub modes: Vec<ModeInfo>,
    /// Bitmask of CRTC indices reachable through the connector's encoders
    pub possible_crtcs: u32,
    /// Names of the properties the connector exposes
    pub properties: HashSet<String>,
    /// Raw identification data of the sink
    pub edid: Option<Vec<u8>>,
}

impl ConnectorInfo {
    /// Whether a sink is attached
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectorStatus::Connected
    }

    /// Whether the connector exposes property `name`
    #[inline]
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains(name)
    }
}

/// Everything discovered on a device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    /// CRTCs in device order
    pub crtcs: Vec<CrtcInfo>,
    /// All planes
    pub planes: Vec<PlaneInfo>,
    /// All connectors
    pub connectors: Vec<ConnectorInfo>,
}

/// A connector bound to a CRTC and the planes that can feed it
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Connector of the display
    pub connector: ConnectorInfo,
    /// CRTC driving the connector
    pub crtc: CrtcInfo,
    /// Primary plane of the CRTC
    pub primary: PlaneInfo,
    /// Overlay planes usable with the CRTC, lowest zpos first
    pub overlays: Vec<PlaneInfo>,
}

impl Topology {
    /// Binds every connector to the first compatible CRTC not taken yet
    ///
    /// Connectors without a free CRTC or without a primary plane are skipped.
    /// A plane is handed to at most one pipeline.
    pub fn pipelines(&self) -> Vec<Pipeline> {
        let mut used_crtcs = HashSet::new();
        let mut used_planes = HashSet::new();
        let mut pipelines = Vec::new();

        for connector in &self.connectors {
            let Some(crtc) = self
                .crtcs
                .iter()
                .find(|crtc| connector.possible_crtcs & (1 << crtc.index) != 0 && !used_crtcs.contains(&crtc.id))
            else {
                trace!(connector = ?connector.id, "No free crtc for connector");
                continue;
            };

            let mut candidates = self
                .planes
                .iter()
                .filter(|plane| plane.compatible_with(crtc.index) && !used_planes.contains(&plane.id));
            let Some(primary) = candidates.clone().find(|plane| plane.kind == PlaneKind::Primary) else {
                trace!(crtc = ?crtc.id, "No primary plane for crtc");
                continue;
            };
            let mut overlays = candidates
                .by_ref()
                .filter(|plane| plane.kind == PlaneKind::Overlay)
                .cloned()
                .collect::<Vec<_>>();
            overlays.sort_by_key(|plane| (plane.zpos.unwrap_or(0), plane.id));

            used_crtcs.insert(crtc.id);
            used_planes.insert(primary.id);
            used_planes.extend(overlays.iter().map(|plane| plane.id));

            pipelines.push(Pipeline {
                connector: connector.clone(),
                crtc: crtc.clone(),
                primary: primary.clone(),
                overlays,
            });
        }

        pipelines
    }
}

/// Dots per inch along one axis, 160 when the physical size is unknown
pub fn dpi(pixels: u16, mm: u32) -> f32 {
    if mm == 0 {
        return 160.0;
    }
    pixels as f32 * 25.4 / mm as f32
}

/// Builds display configs from a connector's modes
///
/// Ids are assigned consecutively from `first_id`. A config's `mode_id` is
/// the index of its mode plus one. Modes repeating an earlier
/// size and refresh rate are skipped.
pub fn configs_from_modes(connector: &ConnectorInfo, first_id: ConfigId) -> Vec<DisplayConfig> {
    let mut seen = HashSet::new();
    let mut configs = Vec::new();
    for (index, mode) in connector.modes.iter().enumerate() {
        let refresh = mode.refresh_hz();
        if !seen.insert((mode.hdisplay, mode.vdisplay, refresh)) {
            continue;
        }
        let mut config = DisplayConfig::new(
            first_id + configs.len() as ConfigId,
            mode.hdisplay as i32,
            mode.vdisplay as i32,
            refresh,
            dpi(mode.hdisplay, connector.mm_width),
        );
        config.dpi_y = dpi(mode.vdisplay, connector.mm_height);
        config.mode_id = index as u64 + 1;
        configs.push(config);
    }
    configs
}

/// Picks the active config: the requested mode, else the sink's preferred one, else the first
pub fn select_active(
    configs: &[DisplayConfig],
    modes: &[ModeInfo],
    preferred: Option<&PreferredMode>,
) -> Option<ConfigId> {
    if let Some(want) = preferred {
        let exact = configs.iter().find(|config| {
            config.width == want.width
                && config.height == want.height
                && (want.refresh == 0 || config.refresh_hz() == want.refresh)
        });
        if let Some(config) = exact {
            return Some(config.id);
        }
    }

    configs
        .iter()
        .find(|config| {
            (config.mode_id as usize)
                .checked_sub(1)
                .and_then(|index| modes.get(index))
                .map(ModeInfo::is_preferred)
                .unwrap_or(false)
        })
        .or_else(|| configs.first())
        .map(|config| config.id)
}

const IN_FORMATS_HEADER: usize = 24;
const IN_FORMATS_MODIFIER: usize = 24;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_ne_bytes(raw))
}

/// Decodes an `IN_FORMATS` property blob into formats and their modifiers
///
/// Unknown fourcc codes are skipped. Returns `None` for a truncated blob.
pub fn parse_in_formats(blob: &[u8]) -> Option<IndexMap<Fourcc, SmallVec<[u64; 4]>>> {
    if blob.len() < IN_FORMATS_HEADER {
        return None;
    }
    let count_formats = read_u32(blob, 8)? as usize;
    let formats_offset = read_u32(blob, 12)? as usize;
    let count_modifiers = read_u32(blob, 16)? as usize;
    let modifiers_offset = read_u32(blob, 20)? as usize;

    let mut codes = Vec::with_capacity(count_formats);
    for i in 0..count_formats {
        codes.push(read_u32(blob, formats_offset + i * 4)?);
    }

    let mut result: IndexMap<Fourcc, SmallVec<[u64; 4]>> = IndexMap::new();
    for code in &codes {
        if let Ok(fourcc) = Fourcc::try_from(*code) {
            result.entry(fourcc).or_default();
        }
    }

    for m in 0..count_modifiers {
        let base = modifiers_offset + m * IN_FORMATS_MODIFIER;
        let mask = read_u64(blob, base)?;
        let offset = read_u32(blob, base + 8)? as usize;
        let modifier = read_u64(blob, base + 16)?;
        for bit in 0..64usize {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let Some(code) = codes.get(offset + bit) else {
                break;
            };
            if let Ok(fourcc) = Fourcc::try_from(*code) {
                let modifiers = result.entry(fourcc).or_default();
                if !modifiers.contains(&modifier) {
                    modifiers.push(modifier);
                }
            }
        }
    }

    Some(result)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::backend::allocator::format::DRM_FORMAT_MOD_AMPHION_TILED;

    pub(crate) fn plane(id: u32, kind: PlaneKind, crtcs: u32, formats: &[(Fourcc, &[u64])]) -> PlaneInfo {
        PlaneInfo {
            id: PlaneId(id),
            kind,
            possible_crtcs: crtcs,
            formats: formats
                .iter()
                .map(|(fourcc, modifiers)| (*fourcc, modifiers.iter().copied().collect()))
                .collect(),
            zpos: None,
            properties: ["FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "IN_FENCE_FD"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub(crate) fn mode(w: u16, h: u16, hz: u32, preferred: bool) -> ModeInfo {
        let htotal = w + 100;
        let vtotal = h + 50;
        ModeInfo {
            clock: (htotal as u32 * vtotal as u32 * hz) / 1000,
            hdisplay: w,
            htotal,
            vdisplay: h,
            vtotal,
            vrefresh: hz,
            mode_type: if preferred { MODE_TYPE_PREFERRED } else { 0 },
            name: format!("{}x{}", w, h),
            ..Default::default()
        }
    }

    pub(crate) fn connector(id: u32, crtcs: u32, modes: Vec<ModeInfo>) -> ConnectorInfo {
        ConnectorInfo {
            id: ConnectorId(id),
            status: if modes.is_empty() {
                ConnectorStatus::Disconnected
            } else {
                ConnectorStatus::Connected
            },
            interface: String::from("HDMI-A"),
            mm_width: 0,
            mm_height: 0,
            modes,
            possible_crtcs: crtcs,
            properties: ["CRTC_ID", "DPMS"].iter().map(|s| s.to_string()).collect(),
            edid: None,
        }
    }

    pub(crate) fn crtc(id: u32, index: u32) -> CrtcInfo {
        CrtcInfo {
            id: CrtcId(id),
            index,
            properties: ["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    #[test]
    fn plane_format_matching() {
        let p = plane(
            1,
            PlaneKind::Overlay,
            1,
            &[(Fourcc::Nv12, &[DRM_FORMAT_MOD_AMPHION_TILED]), (Fourcc::Argb8888, &[])],
        );
        assert!(p.supports(Fourcc::Nv12, Modifier::Linear));
        assert!(p.supports(Fourcc::Nv12, Modifier::from(DRM_FORMAT_MOD_AMPHION_TILED)));
        assert!(!p.supports(Fourcc::Argb8888, Modifier::from(DRM_FORMAT_MOD_AMPHION_TILED)));
        assert!(!p.supports(Fourcc::Yuyv, Modifier::Linear));
        assert!(p.compatible_with(0));
        assert!(!p.compatible_with(1));
    }

    #[test]
    fn pipelines_take_first_free_crtc() {
        let topology = Topology {
            crtcs: vec![crtc(10, 0), crtc(11, 1)],
            planes: vec![
                plane(20, PlaneKind::Primary, 0b01, &[(Fourcc::Xrgb8888, &[])]),
                plane(21, PlaneKind::Primary, 0b10, &[(Fourcc::Xrgb8888, &[])]),
                plane(22, PlaneKind::Overlay, 0b11, &[(Fourcc::Nv12, &[])]),
                plane(23, PlaneKind::Overlay, 0b10, &[(Fourcc::Nv12, &[])]),
            ],
            connectors: vec![
                connector(30, 0b11, vec![mode(1920, 1080, 60, true)]),
                connector(31, 0b11, vec![mode(1280, 720, 60, true)]),
            ],
        };

        let pipelines = topology.pipelines();
        assert_eq!(pipelines.len(), 2);
        assert_eq!(pipelines[0].crtc.id, CrtcId(10));
        assert_eq!(pipelines[0].primary.id, PlaneId(20));
        assert_eq!(
            pipelines[0].overlays.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![PlaneId(22)]
        );
        assert_eq!(pipelines[1].crtc.id, CrtcId(11));
        assert_eq!(pipelines[1].primary.id, PlaneId(21));
        assert_eq!(
            pipelines[1].overlays.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![PlaneId(23)]
        );
    }

    #[test]
    fn configs_and_active_selection() {
        let mut conn = connector(
            1,
            1,
            vec![
                mode(1280, 720, 60, false),
                mode(1920, 1080, 60, true),
                mode(1920, 1080, 60, false),
                mode(1920, 1080, 30, false),
            ],
        );
        conn.mm_width = 508;
        conn.mm_height = 286;

        let configs = configs_from_modes(&conn, 5);
        assert_eq!(configs.iter().map(|c| c.id).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(configs[1].refresh_hz(), 60);
        assert_eq!(configs[2].refresh_hz(), 30);
        assert_eq!(configs[2].mode_id, 4);
        assert!((configs[1].dpi_x - 96.0).abs() < 0.1);

        assert_eq!(select_active(&configs, &conn.modes, None), Some(6));
        let want = PreferredMode {
            width: 1920,
            height: 1080,
            refresh: 30,
        };
        assert_eq!(select_active(&configs, &conn.modes, Some(&want)), Some(7));
        let missing = PreferredMode {
            width: 640,
            height: 480,
            refresh: 0,
        };
        assert_eq!(select_active(&configs, &conn.modes, Some(&missing)), Some(6));
    }

    #[test]
    fn unknown_physical_size_defaults_dpi() {
        assert_eq!(dpi(1920, 0), 160.0);
    }

    fn in_formats_blob(codes: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
        let formats_offset = 24u32;
        let modifiers_offset = formats_offset + codes.len() as u32 * 4;
        let mut blob = Vec::new();
        for v in [1u32, 0, codes.len() as u32, formats_offset, modifiers.len() as u32, modifiers_offset] {
            blob.extend_from_slice(&v.to_ne_bytes());
        }
        for code in codes {
            blob.extend_from_slice(&code.to_ne_bytes());
        }
        for (mask, offset, modifier) in modifiers {
            blob.extend_from_slice(&mask.to_ne_bytes());
            blob.extend_from_slice(&offset.to_ne_bytes());
            blob.extend_from_slice(&0u32.to_ne_bytes());
            blob.extend_from_slice(&modifier.to_ne_bytes());
        }
        blob
    }

    #[test]
    fn in_formats_blob_decoding() {
        let codes = [Fourcc::Argb8888 as u32, Fourcc::Nv12 as u32, 0x2020_2020];
        let blob = in_formats_blob(&codes, &[(0b011, 0, 0), (0b010, 0, DRM_FORMAT_MOD_AMPHION_TILED)]);
        let formats = parse_in_formats(&blob).unwrap();
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[&Fourcc::Argb8888].as_slice(), &[0]);
        assert_eq!(formats[&Fourcc::Nv12].as_slice(), &[0, DRM_FORMAT_MOD_AMPHION_TILED]);
        assert!(parse_in_formats(&blob[..10]).is_none());
    }
}
