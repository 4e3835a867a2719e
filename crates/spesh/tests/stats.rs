//! End-to-end behavior of the statistics aggregator.

use cranelift_entity::PrimaryMap;
use kestrel_spesh::{
    cleanup, dump_stats, update, ArgFlags, Callsite, CallsiteData, CorrelationId, LogEvent, ObjRef,
    SpeshContext, SpeshHeap, SpeshLog, SpeshStats, StaticFrame, StaticFrameData, Tunables,
};
use std::collections::{HashMap, HashSet};

/// A host heap that records every barrier and answers the type queries from
/// tables the test sets up.
#[derive(Default)]
struct TestHeap {
    containers: HashSet<ObjRef>,
    code: HashMap<ObjRef, StaticFrame>,
    barriers: Vec<(StaticFrame, ObjRef)>,
    in_spesh_transitions: Vec<bool>,
}

impl SpeshHeap for TestHeap {
    fn write_barrier(&mut self, frame: StaticFrame, obj: ObjRef) {
        self.barriers.push((frame, obj));
    }

    fn is_container_type(&self, ty: ObjRef) -> bool {
        self.containers.contains(&ty)
    }

    fn code_static_frame(&self, obj: ObjRef) -> Option<StaticFrame> {
        self.code.get(&obj).copied()
    }

    fn set_in_spesh(&mut self, active: bool) {
        self.in_spesh_transitions.push(active);
    }
}

#[derive(Default)]
struct Fixture {
    frames: PrimaryMap<StaticFrame, StaticFrameData>,
    callsites: PrimaryMap<Callsite, CallsiteData>,
    heap: TestHeap,
    tunables: Tunables,
    updated: Vec<StaticFrame>,
}

impl Fixture {
    fn new() -> Self {
        Self::default()
    }

    fn frame(&mut self) -> StaticFrame {
        self.frames.push(StaticFrameData::default())
    }

    fn callsite(&mut self, data: CallsiteData) -> Callsite {
        self.callsites.push(data)
    }

    fn run(&mut self, version: u64, log: &SpeshLog) {
        let mut cx = SpeshContext {
            frames: &mut self.frames,
            callsites: &self.callsites,
            heap: &mut self.heap,
            version,
            tunables: &self.tunables,
        };
        update(&mut cx, log, &mut self.updated);
    }

    fn cleanup(&mut self, version: u64) {
        let mut cx = SpeshContext {
            frames: &mut self.frames,
            callsites: &self.callsites,
            heap: &mut self.heap,
            version,
            tunables: &self.tunables,
        };
        cleanup(&mut cx, &mut self.updated);
    }

    fn stats(&self, frame: StaticFrame) -> &SpeshStats {
        self.frames[frame].spesh.as_ref().expect("frame has no statistics")
    }
}

fn cid(n: u32) -> CorrelationId {
    CorrelationId::new(n)
}

fn obj(n: u32) -> ObjRef {
    ObjRef::from_u32(n)
}

fn log_of(events: &[LogEvent]) -> SpeshLog {
    let mut log = SpeshLog::new();
    for &event in events {
        log.record(event);
    }
    log
}

#[test]
fn entry_with_parameter_builds_a_tuple() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let cs = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let ty = obj(100);
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs) },
        LogEvent::Parameter { id: cid(1), arg_idx: 0, ty, concrete: true },
    ]);
    fx.run(1, &log);

    let stats = fx.stats(a);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.last_update, 1);
    assert_eq!(stats.by_callsite.len(), 1);
    let by_cs = &stats.by_callsite[0];
    assert_eq!(by_cs.callsite, Some(cs));
    assert_eq!(by_cs.hits, 1);
    assert_eq!(by_cs.by_type.len(), 1);
    let by_type = &by_cs.by_type[0];
    assert_eq!(by_type.hits, 1);
    assert_eq!(by_type.arg_types.len(), 1);
    assert_eq!(by_type.arg_types[0].ty, Some(ty));
    assert!(by_type.arg_types[0].ty_concrete);
    assert_eq!(fx.updated, vec![a]);
    assert!(fx.heap.barriers.contains(&(a, ty)));
}

#[test]
fn incomplete_tuple_is_not_stored() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let cs = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let log = log_of(&[LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs) }]);
    fx.run(1, &log);

    let stats = fx.stats(a);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.osr_hits, 0);
    assert_eq!(stats.by_callsite[0].hits, 1);
    assert!(stats.by_callsite[0].by_type.is_empty());
}

#[test]
fn container_slot_needs_a_decont_observation() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let cs = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let container = obj(7);
    let inner = obj(8);
    fx.heap.containers.insert(container);

    // Container type observed without its decont type: unsafe to key on.
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs) },
        LogEvent::Parameter { id: cid(1), arg_idx: 0, ty: container, concrete: true },
    ]);
    fx.run(1, &log);
    assert!(fx.stats(a).by_callsite[0].by_type.is_empty());

    // With the decont observation the tuple completes.
    let log = log_of(&[
        LogEvent::Entry { id: cid(2), frame: a, callsite: Some(cs) },
        LogEvent::Parameter { id: cid(2), arg_idx: 0, ty: container, concrete: true },
        LogEvent::ParameterDecont { id: cid(2), arg_idx: 0, ty: inner, concrete: true },
    ]);
    fx.run(1, &log);
    let by_type = &fx.stats(a).by_callsite[0].by_type[0];
    assert_eq!(by_type.arg_types[0].ty, Some(container));
    assert_eq!(by_type.arg_types[0].decont_ty, Some(inner));
}

#[test]
fn return_type_attributes_to_the_callers_invoke_offset() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let b = fx.frame();
    let cs_a = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let cs_b = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let ty_a = obj(10);
    let ty_b = obj(11);
    let ret_ty = obj(12);
    let code_b = obj(20);
    fx.heap.code.insert(code_b, b);

    // Producer order: the caller logs its invoke before the callee's entry.
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs_a) },
        LogEvent::Parameter { id: cid(1), arg_idx: 0, ty: ty_a, concrete: true },
        LogEvent::Invoke { id: cid(1), offset: 42, code: code_b },
        LogEvent::Entry { id: cid(2), frame: b, callsite: Some(cs_b) },
        LogEvent::Parameter { id: cid(2), arg_idx: 0, ty: ty_b, concrete: true },
        LogEvent::Return { id: cid(2), offset: 7, ty: Some(ret_ty), concrete: true },
    ]);
    fx.run(1, &log);

    let stats = fx.stats(a);
    let by_type = &stats.by_callsite[0].by_type[0];
    assert_eq!(by_type.by_offset.len(), 1);
    let at_42 = &by_type.by_offset[0];
    assert_eq!(at_42.offset, 42);
    // The callee's return type, observed at the caller's invoke offset.
    assert!(at_42
        .types
        .iter()
        .any(|tc| tc.ty == ret_ty && tc.concrete && tc.count == 1));
    // The invoked code object itself.
    assert!(at_42.values.iter().any(|vc| vc.value == code_b && vc.count == 1));
    // And the argument tuple the callee was invoked with.
    assert!(at_42
        .type_tuples
        .iter()
        .any(|tt| tt.callsite == cs_b && tt.arg_types[0].ty == Some(ty_b) && tt.count == 1));
    // Barriers covered the handles installed into `a`'s tree.
    for handle in [ret_ty, code_b, ty_b] {
        assert!(fx.heap.barriers.contains(&(a, handle)), "no barrier for {handle}");
    }
}

#[test]
fn recursion_records_max_depth() {
    let mut fx = Fixture::new();
    let f = fx.frame();
    let mut events = Vec::new();
    for i in 1..=5 {
        events.push(LogEvent::Entry { id: cid(i), frame: f, callsite: None });
    }
    // Returning the outermost invocation implies the rest returned too.
    events.push(LogEvent::Return { id: cid(1), offset: 0, ty: None, concrete: false });
    fx.run(1, &log_of(&events));

    let stats = fx.stats(f);
    assert_eq!(stats.hits, 5);
    assert_eq!(stats.by_callsite[0].max_depth, 5);
}

#[test]
fn empty_log_changes_nothing() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let log = log_of(&[LogEvent::Entry { id: cid(1), frame: a, callsite: None }]);
    fx.run(1, &log);
    fx.updated.clear();

    fx.run(2, &SpeshLog::new());
    assert!(fx.updated.is_empty());
    let stats = fx.stats(a);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.last_update, 1);
}

#[test]
fn entry_accounting_across_frames() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let b = fx.frame();
    let mut events = Vec::new();
    let mut next = 1;
    for _ in 0..3 {
        events.push(LogEvent::Entry { id: cid(next), frame: a, callsite: None });
        events.push(LogEvent::Return { id: cid(next), offset: 0, ty: None, concrete: false });
        next += 1;
    }
    for _ in 0..2 {
        events.push(LogEvent::Entry { id: cid(next), frame: b, callsite: None });
        events.push(LogEvent::Return { id: cid(next), offset: 0, ty: None, concrete: false });
        next += 1;
    }
    fx.run(1, &log_of(&events));

    assert_eq!(fx.stats(a).hits + fx.stats(b).hits, 5);
    // Each frame is in the update sink exactly once.
    assert_eq!(fx.updated, vec![a, b]);
    // Callsite hit counts partition the frame's hits.
    for frame in [a, b] {
        let stats = fx.stats(frame);
        let sum: u32 = stats.by_callsite.iter().map(|bc| bc.hits).sum();
        assert_eq!(sum, stats.hits);
    }
}

#[test]
fn osr_hits_fold_into_frame_and_callsite() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: None },
        LogEvent::Osr { id: cid(1) },
        LogEvent::Osr { id: cid(1) },
        LogEvent::Osr { id: cid(1) },
    ]);
    fx.run(1, &log);

    let stats = fx.stats(a);
    assert_eq!(stats.osr_hits, 3);
    assert_eq!(stats.by_callsite[0].osr_hits, 3);
    assert!(stats.by_callsite[0].osr_hits <= stats.osr_hits);
}

#[test]
fn first_static_value_per_offset_wins() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let (v1, v2, v3) = (obj(1), obj(2), obj(3));
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: None },
        LogEvent::Static { id: cid(1), offset: 10, value: v1 },
        LogEvent::Static { id: cid(1), offset: 10, value: v2 },
        LogEvent::Static { id: cid(1), offset: 20, value: v3 },
    ]);
    fx.run(1, &log);

    let stats = fx.stats(a);
    assert_eq!(stats.static_values.len(), 2);
    assert_eq!(stats.static_values[0].offset, 10);
    assert_eq!(stats.static_values[0].value, v1);
    assert_eq!(stats.static_values[1].offset, 20);
    assert_eq!(stats.static_values[1].value, v3);
    assert!(fx.heap.barriers.contains(&(a, v1)));
    assert!(!fx.heap.barriers.contains(&(a, v2)));
}

#[test]
fn events_with_unknown_ids_are_dropped() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let log = log_of(&[
        LogEvent::Type { id: cid(99), offset: 4, ty: obj(5), concrete: true },
        LogEvent::Osr { id: cid(98) },
        LogEvent::Return { id: cid(97), offset: 0, ty: None, concrete: false },
        LogEvent::Entry { id: cid(1), frame: a, callsite: None },
    ]);
    fx.run(1, &log);
    assert_eq!(fx.stats(a).hits, 1);
}

#[test]
fn deeper_events_imply_shallower_returns() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let b = fx.frame();
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: None },
        LogEvent::Entry { id: cid(2), frame: b, callsite: None },
        // Addressed to the outer frame: the inner one must pop first.
        LogEvent::Osr { id: cid(1) },
    ]);
    fx.run(1, &log);

    assert_eq!(fx.stats(b).by_callsite[0].max_depth, 2);
    assert_eq!(fx.stats(a).by_callsite[0].max_depth, 1);
    assert_eq!(fx.stats(a).osr_hits, 1);
    assert_eq!(fx.stats(b).osr_hits, 0);
}

#[test]
fn distinct_tuples_get_distinct_entries() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let cs = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let (t1, t2) = (obj(1), obj(2));
    let mut events = Vec::new();
    for (i, ty) in [t1, t2, t1].iter().enumerate() {
        let id = cid(i as u32 + 1);
        events.push(LogEvent::Entry { id, frame: a, callsite: Some(cs) });
        events.push(LogEvent::Parameter { id, arg_idx: 0, ty: *ty, concrete: true });
        events.push(LogEvent::Return { id, offset: 0, ty: None, concrete: false });
    }
    fx.run(1, &log_of(&events));

    let by_cs = &fx.stats(a).by_callsite[0];
    assert_eq!(by_cs.by_type.len(), 2);
    let hits_of = |ty: ObjRef| {
        by_cs
            .by_type
            .iter()
            .find(|bt| bt.arg_types[0].ty == Some(ty))
            .map(|bt| bt.hits)
    };
    assert_eq!(hits_of(t1), Some(2));
    assert_eq!(hits_of(t2), Some(1));
    // Distinct entries really differ in tuple contents.
    assert_ne!(by_cs.by_type[0].arg_types, by_cs.by_type[1].arg_types);
}

#[test]
fn cleanup_ages_out_stale_frames() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let b = fx.frame();
    let log_a = log_of(&[LogEvent::Entry { id: cid(1), frame: a, callsite: None }]);
    let log_b = log_of(&[LogEvent::Entry { id: cid(2), frame: b, callsite: None }]);
    fx.run(1, &log_a);
    fx.run(8, &log_b);
    assert_eq!(fx.updated, vec![a, b]);

    // Within max_age of version 1: both retained.
    fx.cleanup(11);
    assert_eq!(fx.updated, vec![a, b]);
    assert!(fx.frames[a].spesh.is_some());

    // Version 12 puts frame `a` (last updated at 1) past max_age 10.
    fx.cleanup(12);
    assert_eq!(fx.updated, vec![b]);
    assert!(fx.frames[a].spesh.is_none());
    assert!(fx.frames[b].spesh.is_some());

    // A frame whose stats are already gone is dropped from the sink.
    fx.frames[b].spesh = None;
    fx.cleanup(12);
    assert!(fx.updated.is_empty());
}

#[test]
fn gc_mark_reports_every_stored_handle() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let b = fx.frame();
    let cs_a = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let cs_b = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let ty_a = obj(10);
    let ty_b = obj(11);
    let ret_ty = obj(12);
    let code_b = obj(20);
    let static_v = obj(30);
    fx.heap.code.insert(code_b, b);
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs_a) },
        LogEvent::Parameter { id: cid(1), arg_idx: 0, ty: ty_a, concrete: true },
        LogEvent::Static { id: cid(1), offset: 3, value: static_v },
        LogEvent::Invoke { id: cid(1), offset: 42, code: code_b },
        LogEvent::Entry { id: cid(2), frame: b, callsite: Some(cs_b) },
        LogEvent::Parameter { id: cid(2), arg_idx: 0, ty: ty_b, concrete: true },
        LogEvent::Return { id: cid(2), offset: 7, ty: Some(ret_ty), concrete: true },
    ]);
    fx.run(1, &log);

    let mut worklist = Vec::new();
    fx.stats(a).gc_mark(&mut worklist);
    for handle in [ty_a, ret_ty, code_b, static_v, ty_b] {
        assert!(worklist.contains(&handle), "{handle} not marked");
    }
}

#[test]
fn debug_gc_brackets_the_update() {
    let mut fx = Fixture::new();
    fx.tunables.debug_gc = true;
    let a = fx.frame();
    let log = log_of(&[LogEvent::Entry { id: cid(1), frame: a, callsite: None }]);
    fx.run(1, &log);
    assert_eq!(fx.heap.in_spesh_transitions, vec![true, false]);
}

#[test]
fn dump_renders_the_tree() {
    let mut fx = Fixture::new();
    let a = fx.frame();
    let cs = fx.callsite(CallsiteData::positional(vec![ArgFlags::OBJ]));
    let log = log_of(&[
        LogEvent::Entry { id: cid(1), frame: a, callsite: Some(cs) },
        LogEvent::Parameter { id: cid(1), arg_idx: 0, ty: obj(10), concrete: true },
    ]);
    fx.run(1, &log);

    let text = dump_stats(a, fx.stats(a));
    assert!(text.contains("1 hits"));
    assert!(text.contains("callsite"));
    assert!(text.contains("tuple"));
}
