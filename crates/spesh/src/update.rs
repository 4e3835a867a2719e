//! Folding a log into statistics.
//!
//! The log is a flat stream: events from every call depth are interleaved,
//! tied to their invocations only by correlation id. The aggregator replays
//! the stream against a simulated call stack, matching callee outcomes to
//! caller callsites and buffering per-offset observations on each simulated
//! frame until the frame pops, which is when the frame's complete argument
//! tuple is known and the observations have a [`ByType`] to attach to.
//!
//! Correlation-id lookup runs the *implicit return* discipline: events name
//! their frame by id, and when an event addresses a frame below the top of
//! the simulated stack, everything above it is popped first. Return events
//! for intermediate frames may be missing from a log, but any deeper frame's
//! event proves the shallower ones returned. Events whose id matches no open
//! frame are dropped; they belong to invocations whose entry predates the
//! log.
//!
//! The aggregator trusts the instrumentation. Log-content anomalies
//! (orphaned events, truncated parameter lists) are absorbed by dropping the
//! unattributable data; states the instrumentation cannot produce (such as a
//! pop of an empty stack) panic.

use crate::callsite::{ArgFlags, CallsiteData};
use crate::entities::{Callsite, ObjRef, StaticFrame};
use crate::events::{CorrelationId, LogEvent, SpeshLog};
use crate::heap::SpeshHeap;
use crate::stats::{ByType, ObsType, StaticFrameData, StaticValue};
use crate::Tunables;
use cranelift_entity::PrimaryMap;
use log::{debug, trace};
use smallvec::SmallVec;

/// Everything one statistics pass needs from the host, passed explicitly.
pub struct SpeshContext<'a, H: SpeshHeap> {
    /// Per-frame statistics storage, owned by the VM.
    pub frames: &'a mut PrimaryMap<StaticFrame, StaticFrameData>,
    /// The VM's interned callsite descriptors.
    pub callsites: &'a PrimaryMap<Callsite, CallsiteData>,
    /// Collector services (write barrier, type queries).
    pub heap: &'a mut H,
    /// The global statistics version. The caller advances it between flush
    /// cycles; trees touched by [`update`] are stamped with it, and
    /// [`cleanup`] ages out trees that lag it by more than
    /// [`Tunables::max_age`]. Callers start it at 1 so that a fresh tree's
    /// zero stamp always counts as lagging.
    pub version: u64,
    /// Subsystem tunables.
    pub tunables: &'a Tunables,
}

/// A frame of the simulated call stack.
struct SimFrame {
    cid: CorrelationId,
    frame: StaticFrame,
    callsite: Option<Callsite>,
    /// Index of the frame's `ByCallsite` entry within its stats tree.
    cs_idx: usize,
    /// The argument tuple under construction, one slot per callsite flag;
    /// `None` when the frame was entered without a callsite.
    arg_types: Option<Box<[ObsType]>>,
    /// Type/invoke observations buffered until pop resolves their `ByType`.
    offset_events: Vec<PendingOffset>,
    /// Argument tuples observed for invocations this frame made, handed up
    /// by callees as they popped.
    call_infos: Vec<PendingCallType>,
    osr_hits: u32,
    last_invoke_offset: u32,
    last_invoke_code: Option<ObjRef>,
}

/// A buffered per-offset observation.
enum PendingOffset {
    Type { offset: u32, ty: ObjRef, concrete: bool },
    Invoke { offset: u32, code: ObjRef },
}

/// An argument tuple observed at one of the frame's invocation sites.
struct PendingCallType {
    offset: u32,
    callsite: Callsite,
    arg_types: Box<[ObsType]>,
}

struct Simulation {
    stack: Vec<SimFrame>,
}

/// Fold `log` into the statistics trees of the frames it mentions.
///
/// Every static frame whose tree is touched at the current version is pushed
/// into `updated` exactly once; the caller keeps that sink around and feeds
/// it to [`cleanup`] after later flush cycles. Beyond the trees and the
/// sink, the pass has no observable effect. It cannot fail on logs the
/// instrumentation can produce.
pub fn update<H: SpeshHeap>(
    cx: &mut SpeshContext<'_, H>,
    log: &SpeshLog,
    updated: &mut Vec<StaticFrame>,
) {
    if cx.tunables.debug_gc {
        cx.heap.set_in_spesh(true);
    }
    let mut sim = Simulation { stack: Vec::new() };
    for &event in log.events() {
        match event {
            LogEvent::Entry { id, frame, callsite } => {
                sim.enter(cx, updated, id, frame, callsite);
            }
            LogEvent::Parameter { id, arg_idx, ty, concrete } => {
                sim.parameter(cx, id, arg_idx, ty, concrete, false);
            }
            LogEvent::ParameterDecont { id, arg_idx, ty, concrete } => {
                sim.parameter(cx, id, arg_idx, ty, concrete, true);
            }
            LogEvent::Type { id, offset, ty, concrete } => {
                if let Some(sim_frame) = sim.find(cx, id) {
                    sim_frame
                        .offset_events
                        .push(PendingOffset::Type { offset, ty, concrete });
                }
            }
            LogEvent::Invoke { id, offset, code } => {
                if let Some(sim_frame) = sim.find(cx, id) {
                    sim_frame
                        .offset_events
                        .push(PendingOffset::Invoke { offset, code });
                    sim_frame.last_invoke_offset = offset;
                    sim_frame.last_invoke_code = Some(code);
                }
            }
            LogEvent::Osr { id } => {
                if let Some(sim_frame) = sim.find(cx, id) {
                    sim_frame.osr_hits += 1;
                }
            }
            LogEvent::Static { id, offset, value } => {
                sim.static_value(cx, id, offset, value);
            }
            LogEvent::Return { id, offset: _, ty, concrete } => {
                sim.ret(cx, id, ty, concrete);
            }
        }
    }
    // End of log: everything still open pops, flushing its buffered data.
    while !sim.stack.is_empty() {
        sim.pop(cx);
    }
    if cx.tunables.debug_gc {
        cx.heap.set_in_spesh(false);
    }
}

/// Age out stale statistics.
///
/// `candidates` is the sink previously filled by [`update`]. Frames whose
/// tree is already gone are dropped from it; frames whose tree lags
/// [`SpeshContext::version`] by more than [`Tunables::max_age`] have the
/// tree destroyed and are dropped; the rest stay, compacted in place.
pub fn cleanup<H: SpeshHeap>(cx: &mut SpeshContext<'_, H>, candidates: &mut Vec<StaticFrame>) {
    let version = cx.version;
    let max_age = cx.tunables.max_age;
    candidates.retain(|&frame| {
        let data = &mut cx.frames[frame];
        match &data.spesh {
            None => false,
            Some(stats) if version.saturating_sub(stats.last_update) > max_age => {
                debug!(
                    "aging out statistics for {frame} (last update {}, version {version})",
                    stats.last_update
                );
                data.spesh = None;
                false
            }
            Some(_) => true,
        }
    });
}

impl Simulation {
    fn enter<H: SpeshHeap>(
        &mut self,
        cx: &mut SpeshContext<'_, H>,
        updated: &mut Vec<StaticFrame>,
        id: CorrelationId,
        frame: StaticFrame,
        callsite: Option<Callsite>,
    ) {
        let stats = cx.frames[frame].spesh.get_or_insert_with(Default::default);
        if stats.last_update < cx.version {
            stats.last_update = cx.version;
            updated.push(frame);
        }
        stats.hits += 1;
        let cs_idx = stats.callsite_index(callsite);
        stats.by_callsite[cs_idx].hits += 1;
        let arg_types = callsite.map(|cs| {
            let count = cx.callsites[cs].flag_count() as usize;
            vec![ObsType::default(); count].into_boxed_slice()
        });
        trace!("enter {frame} ({id}) through {callsite:?}");
        self.stack.push(SimFrame {
            cid: id,
            frame,
            callsite,
            cs_idx,
            arg_types,
            offset_events: Vec::new(),
            call_infos: Vec::new(),
            osr_hits: 0,
            last_invoke_offset: 0,
            last_invoke_code: None,
        });
    }

    /// Find the open frame for `id`, popping everything above it first.
    ///
    /// `None` means the id matches no open frame (its entry predates the
    /// log) and the event should be dropped.
    fn find<'s, H: SpeshHeap>(
        &'s mut self,
        cx: &mut SpeshContext<'_, H>,
        id: CorrelationId,
    ) -> Option<&'s mut SimFrame> {
        let pos = match self.stack.iter().rposition(|f| f.cid == id) {
            Some(pos) => pos,
            None => {
                trace!("dropping event for unknown {id}");
                return None;
            }
        };
        while self.stack.len() > pos + 1 {
            self.pop(cx);
        }
        self.stack.last_mut()
    }

    fn parameter<H: SpeshHeap>(
        &mut self,
        cx: &mut SpeshContext<'_, H>,
        id: CorrelationId,
        arg_idx: u32,
        ty: ObjRef,
        concrete: bool,
        decont: bool,
    ) {
        let Some(sim_frame) = self.find(cx, id) else {
            return;
        };
        let Some(cs) = sim_frame.callsite else {
            return;
        };
        let cs_data = &cx.callsites[cs];
        let Some(flag_idx) = cs_data.flag_for_arg(arg_idx) else {
            // The name word of a named pair; no flag, nothing to observe.
            return;
        };
        let flag_idx = flag_idx as usize;
        assert!(
            flag_idx < cs_data.arg_flags.len(),
            "spesh stats: argument {arg_idx} maps to flag {flag_idx}, out of range for {cs}"
        );
        if !cs_data.arg_flags[flag_idx].contains(ArgFlags::OBJ) {
            return;
        }
        let buf = sim_frame
            .arg_types
            .as_mut()
            .expect("frame has a callsite but no argument tuple buffer");
        let slot = &mut buf[flag_idx];
        if decont {
            slot.decont_ty = Some(ty);
            slot.decont_concrete = concrete;
        } else {
            slot.ty = Some(ty);
            slot.ty_concrete = concrete;
        }
        cx.heap.write_barrier(sim_frame.frame, ty);
    }

    fn static_value<H: SpeshHeap>(
        &mut self,
        cx: &mut SpeshContext<'_, H>,
        id: CorrelationId,
        offset: u32,
        value: ObjRef,
    ) {
        let Some(sim_frame) = self.find(cx, id) else {
            return;
        };
        let frame = sim_frame.frame;
        let stats = cx.frames[frame]
            .spesh
            .as_mut()
            .expect("simulated frame's statistics disappeared mid-update");
        // First observation per offset wins; later ones are dropped.
        if stats.static_values.iter().all(|sv| sv.offset != offset) {
            stats.static_values.push(StaticValue { offset, value });
            cx.heap.write_barrier(frame, value);
        }
    }

    fn ret<H: SpeshHeap>(
        &mut self,
        cx: &mut SpeshContext<'_, H>,
        id: CorrelationId,
        ty: Option<ObjRef>,
        concrete: bool,
    ) {
        if self.find(cx, id).is_none() {
            return;
        }
        let returned = self.pop(cx);
        let Some(ty) = ty else {
            return;
        };
        let Some(caller) = self.stack.last_mut() else {
            return;
        };
        let invoked = caller
            .last_invoke_code
            .and_then(|code| cx.heap.code_static_frame(code));
        if invoked == Some(returned) {
            // The caller's most recent invocation really was of the frame
            // that just returned: observe the return type at the caller's
            // invocation offset.
            caller.offset_events.push(PendingOffset::Type {
                offset: caller.last_invoke_offset,
                ty,
                concrete,
            });
        }
    }

    /// Pop the top simulated frame, flushing its buffered observations into
    /// its statistics tree. Returns the popped frame's static frame.
    fn pop<H: SpeshHeap>(&mut self, cx: &mut SpeshContext<'_, H>) -> StaticFrame {
        let frame_depth = self.stack.len() as u32;
        let Some(sim_frame) = self.stack.pop() else {
            panic!("spesh stats: attempt to pop an empty simulation stack");
        };
        let SimFrame {
            cid,
            frame,
            callsite,
            cs_idx,
            arg_types,
            offset_events,
            call_infos,
            osr_hits,
            last_invoke_offset: _,
            last_invoke_code: _,
        } = sim_frame;
        trace!("pop {frame} ({cid}) at depth {frame_depth}");
        let stats = cx.frames[frame]
            .spesh
            .as_mut()
            .expect("simulated frame's statistics disappeared mid-update");
        stats.osr_hits += osr_hits;
        {
            let by_cs = &mut stats.by_callsite[cs_idx];
            by_cs.osr_hits += osr_hits;
            if by_cs.max_depth < frame_depth {
                by_cs.max_depth = frame_depth;
            }
        }

        // Resolve the type tuple the buffered observations key under. No
        // callsite, no object arguments, or a tuple with unobserved slots
        // (the log can start or stop mid-frame) leaves them nothing safe to
        // attach to, and they are dropped with the frame.
        let mut dest = None;
        if let (Some(cs), Some(buf)) = (callsite, arg_types) {
            let cs_data = &cx.callsites[cs];
            if cs_data.has_object_args() && tuple_complete(cs_data, &*cx.heap, &buf) {
                let by_cs = &mut stats.by_callsite[cs_idx];
                let idx = match by_cs.by_type.iter().position(|bt| *bt.arg_types == *buf) {
                    Some(i) => i,
                    None => {
                        by_cs.by_type.push(ByType::new(buf));
                        by_cs.by_type.len() - 1
                    }
                };
                dest = Some((cs, idx));
            }
        }

        if let Some((cs, idx)) = dest {
            for event in offset_events {
                match event {
                    PendingOffset::Type { offset, ty, concrete } => {
                        let by_offset = stats.by_callsite[cs_idx].by_type[idx].offset_entry(offset);
                        if by_offset.record_type(ty, concrete) {
                            cx.heap.write_barrier(frame, ty);
                        }
                    }
                    PendingOffset::Invoke { offset, code } => {
                        let by_offset = stats.by_callsite[cs_idx].by_type[idx].offset_entry(offset);
                        if by_offset.record_value(code) {
                            cx.heap.write_barrier(frame, code);
                        }
                    }
                }
            }
            for info in call_infos {
                let handles: SmallVec<[ObjRef; 8]> = info
                    .arg_types
                    .iter()
                    .flat_map(|obs| obs.ty.into_iter().chain(obs.decont_ty))
                    .collect();
                let by_offset = stats.by_callsite[cs_idx].by_type[idx].offset_entry(info.offset);
                if by_offset.record_tuple(info.callsite, info.arg_types) {
                    for handle in handles {
                        cx.heap.write_barrier(frame, handle);
                    }
                }
            }
            let by_type = &mut stats.by_callsite[cs_idx].by_type[idx];
            by_type.hits += 1;
            by_type.osr_hits += osr_hits;
            if by_type.max_depth < frame_depth {
                by_type.max_depth = frame_depth;
            }
            // Hand the observed tuple up to the caller, if the caller's most
            // recent invocation really was of this frame.
            if let Some(caller) = self.stack.last_mut() {
                let invoked = caller
                    .last_invoke_code
                    .and_then(|code| cx.heap.code_static_frame(code));
                if invoked == Some(frame) {
                    let arg_types = stats.by_callsite[cs_idx].by_type[idx].arg_types.clone();
                    caller.call_infos.push(PendingCallType {
                        offset: caller.last_invoke_offset,
                        callsite: cs,
                        arg_types,
                    });
                }
            }
        }
        frame
    }
}

/// Whether every object-argument slot of `tuple` has been observed, decont
/// types included for container-typed slots.
fn tuple_complete<H: SpeshHeap>(cs: &CallsiteData, heap: &H, tuple: &[ObsType]) -> bool {
    debug_assert_eq!(cs.arg_flags.len(), tuple.len());
    for (flags, obs) in cs.arg_flags.iter().zip(tuple) {
        if !flags.contains(ArgFlags::OBJ) {
            continue;
        }
        let Some(ty) = obs.ty else {
            return false;
        };
        if heap.is_container_type(ty) && obs.decont_ty.is_none() {
            return false;
        }
    }
    true
}
