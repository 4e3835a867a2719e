//! Profile statistics for Kestrel's speculative specializer ("spesh").
//!
//! Instrumented threads emit linear logs of typed observation events as they
//! run: frame entries, argument types, invocations, returns, OSR crossings,
//! static-value observations. This crate folds such a log into per-frame
//! statistics trees organized by callsite, by observed argument-type tuple,
//! and by bytecode offset: the raw material the specializer reads to decide
//! which type tuples are hot, which call targets dominate a callsite, and
//! which offsets consistently see a single concrete type or value.
//!
//! The interesting part is that the log is flat: events from every call
//! depth are interleaved, tied to their invocations only by correlation id.
//! [`update()`] replays the stream against a simulated call stack to
//! reconstruct the call graph and attribute callee outcomes to caller
//! callsites; see that module's documentation for the discipline involved.
//!
//! The crate owns no heap objects. Type, value and code handles are
//! [`ObjRef`]s borrowed from the GC'd heap; every handle stored into a tree
//! is published through the host's write barrier (the [`SpeshHeap`]
//! contract) and reported at mark time by [`SpeshStats::gc_mark`].
//!
//! A statistics pass is single-threaded: the caller serializes calls to
//! [`update()`] and [`cleanup()`] and owns the version counter and the
//! update sink between calls. There are no suspension points and no internal
//! locking.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod callsite;
mod dump;
mod entities;
mod events;
mod heap;
mod stats;
mod update;

pub use self::callsite::{ArgFlags, CallsiteData};
pub use self::dump::dump_stats;
pub use self::entities::{Callsite, ObjRef, StaticFrame};
pub use self::events::{CorrelationId, LogEvent, SpeshLog};
pub use self::heap::SpeshHeap;
pub use self::stats::{
    ByCallsite, ByOffset, ByType, ObsType, SpeshStats, StaticFrameData, StaticValue, TypeCount,
    TypeTupleCount, ValueCount,
};
pub use self::update::{cleanup, update, SpeshContext};

/// Tunable parameters of the statistics subsystem.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// How many global statistics versions a frame's tree may lag before
    /// [`cleanup()`] destroys it.
    pub max_age: u64,
    /// Bracket [`update()`] with [`SpeshHeap::set_in_spesh`] so a debugging
    /// collector can attribute reference writes. Assertion aid only.
    pub debug_gc: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_age: 10,
            debug_gc: false,
        }
    }
}
