//! Entity references used throughout the statistics subsystem.
//!
//! The aggregator's data structures are full of cross-references: statistics
//! point at callsites, type tuples point at heap objects, the update sink
//! names static frames. None of these are Rust references; everything is a
//! `u32` index into a table owned elsewhere (the VM's frame and callsite
//! arenas, the GC'd heap), wrapped in a distinct index type per entity so we
//! keep type safety without keeping lifetimes.

use cranelift_entity::entity_impl;
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// The compile-time identity of a function or block.
///
/// Statistics attach to the static frame and are shared by all of its dynamic
/// invocations; a recursive function accumulates into one `StaticFrame`'s
/// tree no matter how deep it goes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct StaticFrame(u32);
entity_impl!(StaticFrame, "sf");

/// An immutable descriptor of an invocation's static argument shape.
///
/// Compared by identity: the VM interns callsites, so two callsites with the
/// same flags are still distinct statistics keys if they are distinct
/// entities.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Callsite(u32);
entity_impl!(Callsite, "cs");

/// An opaque handle to an object on the GC'd heap.
///
/// The aggregator never owns the objects behind these; it borrows them,
/// registers each stored handle through the write barrier, and reports them
/// all at mark time.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ObjRef(u32);
entity_impl!(ObjRef, "obj");
