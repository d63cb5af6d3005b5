//! The configuration collaborator.
//!
//! Decides, per function name and per instrumentation point, whether a
//! hook should be inserted — and, per callee name, whether calls to it
//! should be redirected to an interposition wrapper. Two global policies
//! exist: an explicit allow-list (nothing is instrumented unless listed)
//! and an explicit deny-list (everything is instrumented unless listed).
//! Both are concrete implementations of [`InstrumentationConfig`],
//! selected once at startup, so the engine never branches on the mode.

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use weave_ir::Name;

/// A point category the configuration can toggle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentationPoint {
    FunctionEntry,
    FunctionExit,
    BeforeCall,
    AfterCall,
    Detach,
    Sync,
}

bitflags! {
    /// A set of instrumentation points, as stored in list entries.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct PointSet: u8 {
        const FUNCTION_ENTRY = 1 << 0;
        const FUNCTION_EXIT = 1 << 1;
        const BEFORE_CALL = 1 << 2;
        const AFTER_CALL = 1 << 3;
        const DETACH = 1 << 4;
        const SYNC = 1 << 5;
    }
}

impl From<InstrumentationPoint> for PointSet {
    fn from(point: InstrumentationPoint) -> PointSet {
        match point {
            InstrumentationPoint::FunctionEntry => PointSet::FUNCTION_ENTRY,
            InstrumentationPoint::FunctionExit => PointSet::FUNCTION_EXIT,
            InstrumentationPoint::BeforeCall => PointSet::BEFORE_CALL,
            InstrumentationPoint::AfterCall => PointSet::AFTER_CALL,
            InstrumentationPoint::Detach => PointSet::DETACH,
            InstrumentationPoint::Sync => PointSet::SYNC,
        }
    }
}

/// Capability interface queried by the engine.
pub trait InstrumentationConfig {
    /// Should `point` be instrumented for / around `name`?
    fn should_instrument(&self, name: Name, point: InstrumentationPoint) -> bool;

    /// Should calls to `name` be redirected to an interposition wrapper?
    fn should_interpose(&self, name: Name) -> bool;

    /// Does any callee require interposition? Lets the engine skip the
    /// interposition pass wholesale.
    fn any_interposition(&self) -> bool;
}

/// Instrument everything, interpose nothing — the behavior with no
/// configuration file.
#[derive(Debug, Default)]
pub struct DefaultConfig;

impl InstrumentationConfig for DefaultConfig {
    fn should_instrument(&self, _name: Name, _point: InstrumentationPoint) -> bool {
        true
    }

    fn should_interpose(&self, _name: Name) -> bool {
        false
    }

    fn any_interposition(&self) -> bool {
        false
    }
}

/// Explicit allow-list: a point is instrumented only when its function
/// is listed with that point.
#[derive(Debug, Default)]
pub struct AllowList {
    entries: FxHashMap<Name, PointSet>,
    interposed: FxHashSet<Name>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `points` for `name`.
    pub fn allow(&mut self, name: Name, points: PointSet) -> &mut Self {
        *self.entries.entry(name).or_default() |= points;
        self
    }

    /// Mark calls to `name` for interposition.
    pub fn interpose(&mut self, name: Name) -> &mut Self {
        self.interposed.insert(name);
        self
    }
}

impl InstrumentationConfig for AllowList {
    fn should_instrument(&self, name: Name, point: InstrumentationPoint) -> bool {
        self.entries
            .get(&name)
            .is_some_and(|set| set.contains(point.into()))
    }

    fn should_interpose(&self, name: Name) -> bool {
        self.interposed.contains(&name)
    }

    fn any_interposition(&self) -> bool {
        !self.interposed.is_empty()
    }
}

/// Explicit deny-list: everything is instrumented unless listed.
#[derive(Debug, Default)]
pub struct DenyList {
    entries: FxHashMap<Name, PointSet>,
    interposed: FxHashSet<Name>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable `points` for `name`.
    pub fn deny(&mut self, name: Name, points: PointSet) -> &mut Self {
        *self.entries.entry(name).or_default() |= points;
        self
    }

    /// Mark calls to `name` for interposition.
    pub fn interpose(&mut self, name: Name) -> &mut Self {
        self.interposed.insert(name);
        self
    }
}

impl InstrumentationConfig for DenyList {
    fn should_instrument(&self, name: Name, point: InstrumentationPoint) -> bool {
        !self
            .entries
            .get(&name)
            .is_some_and(|set| set.contains(point.into()))
    }

    fn should_interpose(&self, name: Name) -> bool {
        self.interposed.contains(&name)
    }

    fn any_interposition(&self) -> bool {
        !self.interposed.is_empty()
    }
}
