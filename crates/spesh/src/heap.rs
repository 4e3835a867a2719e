//! The contract between the statistics subsystem and the collector.
//!
//! The aggregator stores heap references in long-lived statistics trees, so
//! it participates in the generational story: every reference installed into
//! a tree is published through a write barrier naming the owning static
//! frame's statistics container, and the whole tree is walkable at mark time
//! (see [`SpeshStats::gc_mark`](crate::SpeshStats::gc_mark)). This trait is
//! everything the aggregator needs from the host for that, plus the two type
//! queries the update algorithm depends on.

use crate::entities::{ObjRef, StaticFrame};

/// Host-side heap services used while folding a log into statistics.
pub trait SpeshHeap {
    /// Record that `frame`'s statistics container now references `obj`.
    ///
    /// Called for every handle newly installed anywhere in the frame's tree,
    /// before the update returns; the collector relies on it to preserve
    /// generational invariants when `obj` is young and the container old.
    fn write_barrier(&mut self, frame: StaticFrame, obj: ObjRef);

    /// Whether `ty` is a container type: one whose values hold, and
    /// dereference to, a value of some other type.
    ///
    /// Argument slots observed with a container type are only keyed on once
    /// the dereferenced ("decont") type has been observed too.
    fn is_container_type(&self, ty: ObjRef) -> bool;

    /// If `obj` is a concrete code object, the static frame of its body.
    ///
    /// Used to match a callee back to the caller's most recent invocation
    /// site when attributing return types and argument tuples up the
    /// simulated stack.
    fn code_static_frame(&self, obj: ObjRef) -> Option<StaticFrame>;

    /// Flag that the current thread is (or is no longer) inside a statistics
    /// update, so a debugging collector can tell stats-borne reference
    /// writes from mutator writes. Purely an assertion aid; barriers remain
    /// mandatory either way.
    fn set_in_spesh(&mut self, _active: bool) {}
}
