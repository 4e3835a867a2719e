//! The statistics tree.
//!
//! Each static frame owns at most one [`SpeshStats`] tree, organized by
//! callsite, then by observed argument-type tuple, then by bytecode offset.
//! The specializer reads finished trees to decide which type tuples are hot,
//! which call targets dominate a callsite, and which offsets consistently
//! see a single type or value.
//!
//! All sequences here are searched linearly: per-frame fan-out (distinct
//! callsites, distinct tuples, observed offsets) is small in practice, and
//! the trees are walked far more often than they are extended.
//!
//! Ownership is strictly tree-shaped. Type and value handles are borrowed
//! references into the GC'd heap, registered through the write barrier when
//! installed and reported wholesale by [`SpeshStats::gc_mark`]; dropping a
//! tree frees every owned allocation (tuple copies included) and touches no
//! heap object.

use crate::entities::{Callsite, ObjRef};
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Statistics about the runtime behavior of one static frame.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct SpeshStats {
    /// Number of times the frame was entered.
    pub hits: u32,
    /// Number of times specialized code was entered mid-frame.
    pub osr_hits: u32,
    /// The global stats version current when this tree last changed. A tree
    /// whose version lags too far behind is aged out by
    /// [`cleanup`](crate::cleanup()).
    pub last_update: u64,
    /// Per-callsite statistics; one entry per distinct callsite the frame
    /// was invoked through.
    pub by_callsite: Vec<ByCallsite>,
    /// Values observed to be static at a bytecode offset; first observation
    /// per offset wins.
    pub static_values: SmallVec<[StaticValue; 2]>,
}

/// A value observed to be static at a bytecode offset.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct StaticValue {
    /// Bytecode offset of the observation.
    pub offset: u32,
    /// The observed value.
    pub value: ObjRef,
}

/// Statistics for one (frame, callsite) pair.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ByCallsite {
    /// The callsite, or `None` for entries without one. Distinct per parent:
    /// a frame has at most one `ByCallsite` per callsite identity.
    pub callsite: Option<Callsite>,
    /// Number of entries through this callsite.
    pub hits: u32,
    /// OSR crossings attributed to invocations through this callsite.
    pub osr_hits: u32,
    /// Deepest simulated call depth any such invocation was popped at.
    pub max_depth: u32,
    /// Statistics keyed by complete observed argument-type tuple.
    pub by_type: Vec<ByType>,
}

impl ByCallsite {
    fn new(callsite: Option<Callsite>) -> Self {
        Self {
            callsite,
            hits: 0,
            osr_hits: 0,
            max_depth: 0,
            by_type: Vec::new(),
        }
    }
}

/// One observed argument slot: the type seen, and for container types the
/// type found inside.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ObsType {
    /// The observed type, once a parameter event has filled the slot in.
    pub ty: Option<ObjRef>,
    /// Whether the observed value was concrete.
    pub ty_concrete: bool,
    /// For container-typed slots, the dereferenced type.
    pub decont_ty: Option<ObjRef>,
    /// Concreteness of the dereferenced value.
    pub decont_concrete: bool,
}

/// Statistics for one observed argument-type tuple at a callsite.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ByType {
    /// The tuple, one slot per callsite flag. Owned by this entry;
    /// incomplete tuples are never stored.
    pub arg_types: Box<[ObsType]>,
    /// Number of invocations popped with this tuple.
    pub hits: u32,
    /// OSR crossings attributed to such invocations.
    pub osr_hits: u32,
    /// Deepest simulated call depth any such invocation was popped at.
    pub max_depth: u32,
    /// Per-offset observations, one entry per distinct bytecode offset.
    pub by_offset: Vec<ByOffset>,
}

impl ByType {
    pub(crate) fn new(arg_types: Box<[ObsType]>) -> Self {
        Self {
            arg_types,
            hits: 0,
            osr_hits: 0,
            max_depth: 0,
            by_offset: Vec::new(),
        }
    }

    /// Find or create the [`ByOffset`] entry for `offset`.
    pub(crate) fn offset_entry(&mut self, offset: u32) -> &mut ByOffset {
        match self.by_offset.iter().position(|bo| bo.offset == offset) {
            Some(i) => &mut self.by_offset[i],
            None => {
                self.by_offset.push(ByOffset::new(offset));
                self.by_offset.last_mut().unwrap()
            }
        }
    }
}

/// Observations collected at one bytecode offset.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ByOffset {
    /// The bytecode offset.
    pub offset: u32,
    /// Types observed here, with counts.
    pub types: SmallVec<[TypeCount; 4]>,
    /// Values (invoked code objects) observed here, with counts.
    pub values: SmallVec<[ValueCount; 2]>,
    /// Argument tuples observed for invocations made from here, with counts.
    pub type_tuples: SmallVec<[TypeTupleCount; 1]>,
}

impl ByOffset {
    fn new(offset: u32) -> Self {
        Self {
            offset,
            types: SmallVec::new(),
            values: SmallVec::new(),
            type_tuples: SmallVec::new(),
        }
    }

    /// Count a type observation. Returns whether the (type, concreteness)
    /// pair is newly recorded here.
    pub(crate) fn record_type(&mut self, ty: ObjRef, concrete: bool) -> bool {
        for tc in &mut self.types {
            if tc.ty == ty && tc.concrete == concrete {
                tc.count += 1;
                return false;
            }
        }
        self.types.push(TypeCount {
            ty,
            concrete,
            count: 1,
        });
        true
    }

    /// Count a value observation. Returns whether the value is newly
    /// recorded here.
    pub(crate) fn record_value(&mut self, value: ObjRef) -> bool {
        for vc in &mut self.values {
            if vc.value == value {
                vc.count += 1;
                return false;
            }
        }
        self.values.push(ValueCount { value, count: 1 });
        true
    }

    /// Count an argument-tuple observation, keyed by callsite identity and
    /// tuple contents. Returns whether the key is newly recorded here (the
    /// tuple is only kept in that case).
    pub(crate) fn record_tuple(&mut self, callsite: Callsite, arg_types: Box<[ObsType]>) -> bool {
        for tt in &mut self.type_tuples {
            if tt.callsite == callsite && tt.arg_types == arg_types {
                tt.count += 1;
                return false;
            }
        }
        self.type_tuples.push(TypeTupleCount {
            callsite,
            arg_types,
            count: 1,
        });
        true
    }
}

/// A (type, concreteness) observation count.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TypeCount {
    /// The observed type.
    pub ty: ObjRef,
    /// Whether the observed value was concrete.
    pub concrete: bool,
    /// Number of observations.
    pub count: u32,
}

/// A value observation count.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ValueCount {
    /// The observed value.
    pub value: ObjRef,
    /// Number of observations.
    pub count: u32,
}

/// An argument-tuple observation count at an invocation site.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TypeTupleCount {
    /// The callsite of the observed invocation.
    pub callsite: Callsite,
    /// The argument tuple; an owned copy, stable for the tree's lifetime.
    pub arg_types: Box<[ObsType]>,
    /// Number of observations.
    pub count: u32,
}

/// Per-frame state the statistics subsystem keeps on a static frame.
#[derive(Clone, Debug, Default)]
pub struct StaticFrameData {
    /// The frame's statistics tree, created lazily on its first logged entry
    /// and dropped when aged out.
    pub spesh: Option<Box<SpeshStats>>,
}

impl SpeshStats {
    /// Find or create the [`ByCallsite`] entry for `callsite`, returning its
    /// index.
    pub(crate) fn callsite_index(&mut self, callsite: Option<Callsite>) -> usize {
        match self.by_callsite.iter().position(|b| b.callsite == callsite) {
            Some(i) => i,
            None => {
                self.by_callsite.push(ByCallsite::new(callsite));
                self.by_callsite.len() - 1
            }
        }
    }

    /// Enqueue every heap reference stored anywhere in this tree onto the
    /// collector's worklist.
    pub fn gc_mark(&self, worklist: &mut Vec<ObjRef>) {
        for sv in &self.static_values {
            worklist.push(sv.value);
        }
        for by_cs in &self.by_callsite {
            for by_type in &by_cs.by_type {
                mark_tuple(&by_type.arg_types, worklist);
                for by_offset in &by_type.by_offset {
                    for tc in &by_offset.types {
                        worklist.push(tc.ty);
                    }
                    for vc in &by_offset.values {
                        worklist.push(vc.value);
                    }
                    for tt in &by_offset.type_tuples {
                        mark_tuple(&tt.arg_types, worklist);
                    }
                }
            }
        }
    }
}

fn mark_tuple(tuple: &[ObsType], worklist: &mut Vec<ObjRef>) {
    for obs in tuple {
        if let Some(ty) = obs.ty {
            worklist.push(ty);
        }
        if let Some(ty) = obs.decont_ty {
            worklist.push(ty);
        }
    }
}
