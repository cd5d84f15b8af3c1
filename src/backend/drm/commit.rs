//! Staging of atomic mode-setting transactions
//!
//! An [`AtomicRequest`] collects property writes by object and property name.
//! The [`KmsDevice`](super::KmsDevice) resolves names to property handles
//! when the request is submitted, so building a request never touches the
//! kernel.

use indexmap::IndexMap;
use tracing::trace;

use super::topology::{ConnectorId, CrtcId, PlaneId};

/// Object a property belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// A plane
    Plane(PlaneId),
    /// A CRTC
    Crtc(CrtcId),
    /// A connector
    Connector(ConnectorId),
}

impl ObjectRef {
    /// Raw kernel object id
    pub fn raw(self) -> u32 {
        match self {
            ObjectRef::Plane(id) => id.0,
            ObjectRef::Crtc(id) => id.0,
            ObjectRef::Connector(id) => id.0,
        }
    }
}

/// Value of a staged property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropValue {
    /// Unsigned range or enum value
    Unsigned(u64),
    /// Signed range value
    Signed(i64),
    /// Object reference, 0 for none
    Object(u32),
    /// Property blob id, 0 for none
    Blob(u32),
    /// Let the device fill in the address of its out-fence slot
    OutFence,
}

bitflags::bitflags! {
    /// Flags of an atomic commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Only check whether the commit would succeed
        const TEST_ONLY = 1 << 0;
        /// Return before the commit completes
        const NONBLOCK = 1 << 1;
        /// The commit may perform a full modeset
        const ALLOW_MODESET = 1 << 2;
    }
}

/// Property writes applied as one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomicRequest {
    props: IndexMap<(ObjectRef, &'static str), PropValue>,
}

impl AtomicRequest {
    /// Creates an empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Stages a property write, replacing an earlier write of the same property
    pub fn set(&mut self, object: ObjectRef, name: &'static str, value: PropValue) {
        trace!(?object, name, ?value, "Staging property");
        self.props.insert((object, name), value);
    }

    /// Returns the staged value of a property
    pub fn get(&self, object: ObjectRef, name: &'static str) -> Option<PropValue> {
        self.props.get(&(object, name)).copied()
    }

    /// Iterates staged writes in staging order
    pub fn iter(&self) -> impl Iterator<Item = (ObjectRef, &'static str, PropValue)> + '_ {
        self.props.iter().map(|((object, name), value)| (*object, *name, *value))
    }

    /// Number of staged writes
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Returns true if nothing is staged
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Returns true if the request asks for an out-fence
    pub fn wants_out_fence(&self) -> bool {
        self.props.values().any(|value| *value == PropValue::OutFence)
    }

    /// Stages the source and destination rectangles of a plane
    ///
    /// Source coordinates are 16.16 fixed point.
    pub fn set_plane_geometry(&mut self, plane: PlaneId, src: [f64; 4], dst: [i32; 4]) {
        let object = ObjectRef::Plane(plane);
        self.set(object, "SRC_X", PropValue::Unsigned(to_fixed(src[0])));
        self.set(object, "SRC_Y", PropValue::Unsigned(to_fixed(src[1])));
        self.set(object, "SRC_W", PropValue::Unsigned(to_fixed(src[2])));
        self.set(object, "SRC_H", PropValue::Unsigned(to_fixed(src[3])));
        self.set(object, "CRTC_X", PropValue::Signed(dst[0] as i64));
        self.set(object, "CRTC_Y", PropValue::Signed(dst[1] as i64));
        self.set(object, "CRTC_W", PropValue::Unsigned(dst[2].max(0) as u64));
        self.set(object, "CRTC_H", PropValue::Unsigned(dst[3].max(0) as u64));
    }

    /// Stages the writes that detach a plane from its CRTC
    pub fn disable_plane(&mut self, plane: PlaneId) {
        let object = ObjectRef::Plane(plane);
        self.set(object, "CRTC_ID", PropValue::Object(0));
        self.set(object, "FB_ID", PropValue::Object(0));
    }
}

/// Converts to 16.16 fixed point
#[inline]
pub fn to_fixed(n: f64) -> u64 {
    f64::round(n.max(0.0) * (1 << 16) as f64) as u64
}
