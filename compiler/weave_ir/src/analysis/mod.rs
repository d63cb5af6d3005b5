//! Analysis collaborators consumed by the instrumentation engine.
//!
//! Each analysis is computed once per function and then queried through
//! an immutable interface; the engine never mutates analysis results
//! (it invalidates them implicitly by changing the graph they describe,
//! and callers recompute downstream).

mod dom;
mod libcalls;
mod loops;
mod tasks;
mod trip_count;

pub use dom::DomTree;
pub use libcalls::{AllocFnKind, AllocSpec, FreeKind, LibCallRecognizer};
pub use loops::{Loop, LoopForest};
pub use tasks::{
    detached_rethrows_in, task_frame_resume_dest, SharedEhRegion, Task, TaskTree,
};
pub use trip_count::{loop_trip_count, TripCount};
