//! Bit-packed property words passed to hooks.
//!
//! Every hook call receives a `u64` property word describing static
//! facts about the instrumented construct. Layouts are part of the
//! runtime contract and documented per type; unused high bits are zero.
//! `default_word()` is the value used for merge-point default edges — a
//! record with no facts set.

use weave_ir::ir::Operand;

macro_rules! prop_word {
    ($t:ty) => {
        impl $t {
            /// The packed word as a constant operand.
            pub fn operand(self) -> Operand {
                #[expect(
                    clippy::cast_possible_wrap,
                    reason = "property words are small bit patterns"
                )]
                let word = self.pack() as i64;
                Operand::i64(word)
            }

            /// The packed word of a record with no facts set.
            pub fn default_word() -> Operand {
                Self::default().operand()
            }
        }
    };
}

/// Function-entry properties. Bit 0: the function may spawn tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FuncProp {
    pub may_spawn: bool,
}

impl FuncProp {
    pub fn pack(self) -> u64 {
        u64::from(self.may_spawn)
    }
}
prop_word!(FuncProp);

/// Function-exit properties. Bit 0: may spawn; bit 1: exceptional
/// (unwind) return.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FuncExitProp {
    pub may_spawn: bool,
    pub eh_return: bool,
}

impl FuncExitProp {
    pub fn pack(self) -> u64 {
        u64::from(self.may_spawn) | u64::from(self.eh_return) << 1
    }
}
prop_word!(FuncExitProp);

/// Basic-block properties. Bit 0: landing pad; bit 1: exception pad of
/// any kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockProp {
    pub is_landing_pad: bool,
    pub is_eh_pad: bool,
}

impl BlockProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_landing_pad) | u64::from(self.is_eh_pad) << 1
    }
}
prop_word!(BlockProp);

/// Loop properties. Bit 0: the loop is a parallel (fork/join) loop;
/// bit 1: the loop has a unique exiting block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopProp {
    pub is_parallel: bool,
    pub has_unique_exiting_block: bool,
}

impl LoopProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_parallel) | u64::from(self.has_unique_exiting_block) << 1
    }
}
prop_word!(LoopProp);

/// Loop-exit properties. Bit 0: the exiting block is the loop latch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopExitProp {
    pub is_latch: bool,
}

impl LoopExitProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_latch)
    }
}
prop_word!(LoopExitProp);

/// Call-site properties. Bit 0: the call target is not statically known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallProp {
    pub is_indirect: bool,
}

impl CallProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_indirect)
    }
}
prop_word!(CallProp);

/// Memory-access properties.
///
/// Layout: bits 0–7 byte alignment; bit 8 vtable access; bit 9 address
/// of provably constant data; bit 10 underlying object is
/// stack-allocated; bit 11 the pointer may have been captured; bit 12
/// underlying object is thread-local; bit 13 (loads only) the address is
/// read before any write to it later in the same block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStoreProp {
    pub alignment: u8,
    pub is_vtable_access: bool,
    pub is_constant: bool,
    pub is_on_stack: bool,
    pub may_be_captured: bool,
    pub is_thread_local: bool,
    pub load_read_before_write_in_block: bool,
}

impl LoadStoreProp {
    pub fn pack(self) -> u64 {
        u64::from(self.alignment)
            | u64::from(self.is_vtable_access) << 8
            | u64::from(self.is_constant) << 9
            | u64::from(self.is_on_stack) << 10
            | u64::from(self.may_be_captured) << 11
            | u64::from(self.is_thread_local) << 12
            | u64::from(self.load_read_before_write_in_block) << 13
    }
}
prop_word!(LoadStoreProp);

/// Alloca properties. Bit 0: compile-time-sized entry-block allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocaProp {
    pub is_static: bool,
}

impl AllocaProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_static)
    }
}
prop_word!(AllocaProp);

/// Allocation-call properties. Bits 0–7: allocation-function kind code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocFnProp {
    pub kind: u8,
}

impl AllocFnProp {
    pub fn pack(self) -> u64 {
        u64::from(self.kind)
    }
}
prop_word!(AllocFnProp);

/// Free-call properties. Bits 0–7: free-function kind code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeProp {
    pub kind: u8,
}

impl FreeProp {
    pub fn pack(self) -> u64 {
        u64::from(self.kind)
    }
}
prop_word!(FreeProp);

/// Spawned-task properties. Bit 0: the task is a parallel-loop body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskProp {
    pub is_parallel_loop_body: bool,
}

impl TaskProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_parallel_loop_body)
    }
}
prop_word!(TaskProp);

/// Task-exit properties. Bit 0: the task is a parallel-loop body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskExitProp {
    pub is_parallel_loop_body: bool,
}

impl TaskExitProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_parallel_loop_body)
    }
}
prop_word!(TaskExitProp);

/// Fork-continuation properties. Bit 0: this is the exceptional (unwind)
/// continuation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetachContinueProp {
    pub is_unwind: bool,
}

impl DetachContinueProp {
    pub fn pack(self) -> u64 {
        u64::from(self.is_unwind)
    }
}
prop_word!(DetachContinueProp);
