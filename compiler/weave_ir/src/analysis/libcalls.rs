//! Conservative library-call recognizer.
//!
//! Classifies direct callees by name into allocation functions, free
//! functions, and everything else, and records which argument positions
//! carry the statically extractable facts (size, element count,
//! alignment, reallocated pointer). Callees it does not know are
//! ordinary calls.

use rustc_hash::FxHashMap;

use crate::name::{Interner, Name};

/// Kind of a recognized allocation function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocFnKind {
    Malloc,
    Calloc,
    Realloc,
    AlignedAlloc,
    /// `posix_memalign` — recognized, but its out-parameter form defeats
    /// static extraction, so instrumentation skips it.
    PosixMemalign,
    New,
    NewArray,
}

impl AllocFnKind {
    /// Stable numeric code carried in the allocation property word.
    pub fn code(self) -> u8 {
        match self {
            AllocFnKind::Malloc => 0,
            AllocFnKind::Calloc => 1,
            AllocFnKind::Realloc => 2,
            AllocFnKind::AlignedAlloc => 3,
            AllocFnKind::PosixMemalign => 4,
            AllocFnKind::New => 5,
            AllocFnKind::NewArray => 6,
        }
    }
}

/// Kind of a recognized deallocation function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreeKind {
    Free,
    Delete,
    DeleteArray,
}

impl FreeKind {
    /// Stable numeric code carried in the free property word.
    pub fn code(self) -> u8 {
        match self {
            FreeKind::Free => 0,
            FreeKind::Delete => 1,
            FreeKind::DeleteArray => 2,
        }
    }
}

/// Argument positions of the extractable facts of an allocation call.
/// `None` means the fact is not statically extractable for this callee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocSpec {
    pub kind: AllocFnKind,
    pub size_arg: Option<u32>,
    pub count_arg: Option<u32>,
    pub align_arg: Option<u32>,
    pub old_ptr_arg: Option<u32>,
}

/// Name-table-driven classifier for allocation and free calls.
#[derive(Debug)]
pub struct LibCallRecognizer {
    alloc: FxHashMap<Name, AllocSpec>,
    free: FxHashMap<Name, FreeKind>,
}

impl LibCallRecognizer {
    /// Build the recognizer, interning the standard callee names.
    pub fn new(interner: &mut Interner) -> Self {
        let mut alloc = FxHashMap::default();
        let mut free = FxHashMap::default();

        let spec = |kind, size, count, align, old| AllocSpec {
            kind,
            size_arg: size,
            count_arg: count,
            align_arg: align,
            old_ptr_arg: old,
        };

        alloc.insert(
            interner.intern("malloc"),
            spec(AllocFnKind::Malloc, Some(0), None, None, None),
        );
        alloc.insert(
            interner.intern("calloc"),
            spec(AllocFnKind::Calloc, Some(1), Some(0), None, None),
        );
        alloc.insert(
            interner.intern("realloc"),
            spec(AllocFnKind::Realloc, Some(1), None, None, Some(0)),
        );
        alloc.insert(
            interner.intern("aligned_alloc"),
            spec(AllocFnKind::AlignedAlloc, Some(1), None, Some(0), None),
        );
        alloc.insert(
            interner.intern("posix_memalign"),
            spec(AllocFnKind::PosixMemalign, None, None, Some(1), None),
        );
        // Itanium-mangled operator new / new[].
        alloc.insert(
            interner.intern("_Znwm"),
            spec(AllocFnKind::New, Some(0), None, None, None),
        );
        alloc.insert(
            interner.intern("_Znam"),
            spec(AllocFnKind::NewArray, Some(0), None, None, None),
        );

        free.insert(interner.intern("free"), FreeKind::Free);
        free.insert(interner.intern("_ZdlPv"), FreeKind::Delete);
        free.insert(interner.intern("_ZdaPv"), FreeKind::DeleteArray);

        LibCallRecognizer { alloc, free }
    }

    /// The allocation spec for `callee`, if it is a known allocator.
    pub fn alloc_spec(&self, callee: Name) -> Option<AllocSpec> {
        self.alloc.get(&callee).copied()
    }

    /// True if `callee` is a known allocation function.
    pub fn is_allocation_fn(&self, callee: Name) -> bool {
        self.alloc.contains_key(&callee)
    }

    /// The free kind for `callee`, if it is a known deallocator.
    pub fn free_kind(&self, callee: Name) -> Option<FreeKind> {
        self.free.get(&callee).copied()
    }
}
