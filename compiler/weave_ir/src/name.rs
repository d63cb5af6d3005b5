//! Interned string identifiers.
//!
//! Function, global, and hook names occur everywhere in the IR and are
//! compared constantly (table keys, merge-cache keys, callee lookups), so
//! they are interned once into a compact 32-bit [`Name`] and resolved back
//! to text only at serialization boundaries.

use std::fmt;

use rustc_hash::FxHashMap;

/// Interned string identifier.
///
/// IDs are allocated sequentially by an [`Interner`], starting from 0
/// (the pre-interned empty string).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Name(u32);

impl Name {
    /// Pre-interned empty string.
    pub const EMPTY: Name = Name(0);

    /// Get the raw `u32` value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Create from a raw `u32` value.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Name(raw)
    }

    /// Get the index as `usize` (for indexing into `Vec`s).
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.0)
    }
}

impl Default for Name {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Single-threaded string interner.
///
/// The instrumentation engine is a synchronous batch transformation with
/// exactly one writer, so no sharding or locking is needed here.
#[derive(Debug, Default)]
pub struct Interner {
    map: FxHashMap<Box<str>, Name>,
    strings: Vec<Box<str>>,
}

impl Interner {
    /// Create an interner with the empty string pre-interned as
    /// [`Name::EMPTY`].
    pub fn new() -> Self {
        let mut interner = Interner {
            map: FxHashMap::default(),
            strings: Vec::new(),
        };
        let empty = interner.intern("");
        debug_assert_eq!(empty, Name::EMPTY);
        interner
    }

    /// Intern a string, returning its stable [`Name`].
    ///
    /// Repeated calls with the same text return the same `Name`.
    pub fn intern(&mut self, text: &str) -> Name {
        if let Some(&name) = self.map.get(text) {
            return name;
        }
        let id = u32::try_from(self.strings.len())
            .unwrap_or_else(|_| panic!("interner capacity exceeds u32::MAX"));
        let name = Name(id);
        let boxed: Box<str> = text.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, name);
        name
    }

    /// Look up an already-interned string without interning it.
    pub fn get(&self, text: &str) -> Option<Name> {
        self.map.get(text).copied()
    }

    /// Resolve a [`Name`] back to its text.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not produced by this interner.
    pub fn resolve(&self, name: Name) -> &str {
        self.strings
            .get(name.index())
            .unwrap_or_else(|| panic!("Name({}) not interned here", name.raw()))
    }
}
