//! The observation log.
//!
//! Instrumented threads append fixed-shape observation records to a log
//! buffer as they run: frame entries, argument types, per-offset type and
//! invocation observations, OSR crossings, static values, returns. A sealed
//! buffer is handed to the aggregator whole; the aggregator only ever reads
//! it front to back, once.
//!
//! Every record carries the correlation id of the invocation that produced
//! it, which is how the aggregator reconstructs the call stack from the flat
//! stream (see [`update`](crate::update())).

use crate::entities::{Callsite, ObjRef, StaticFrame};
use core::fmt;

/// Identifies one dynamic invocation across all the events it produced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CorrelationId(u32);

impl CorrelationId {
    /// Wrap a raw correlation id from the instrumentation.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cid{}", self.0)
    }
}

/// One observation record.
#[derive(Clone, Copy, Debug)]
pub enum LogEvent {
    /// A frame was entered through the usual calling path.
    Entry {
        /// Correlation id of the new invocation.
        id: CorrelationId,
        /// The frame being entered.
        frame: StaticFrame,
        /// The callsite it was invoked through, or `None` when entered
        /// without one (e.g. a thread entry point).
        callsite: Option<Callsite>,
    },
    /// The type of an incoming object argument.
    Parameter {
        /// Correlation id of the receiving invocation.
        id: CorrelationId,
        /// Runtime argument index (see
        /// [`CallsiteData::flag_for_arg`](crate::CallsiteData::flag_for_arg)).
        arg_idx: u32,
        /// The observed type.
        ty: ObjRef,
        /// Whether the value was a concrete instance rather than a type
        /// object.
        concrete: bool,
    },
    /// The type found inside an incoming container argument.
    ParameterDecont {
        /// Correlation id of the receiving invocation.
        id: CorrelationId,
        /// Runtime argument index.
        arg_idx: u32,
        /// The observed dereferenced type.
        ty: ObjRef,
        /// Concreteness of the dereferenced value.
        concrete: bool,
    },
    /// A type observed at a bytecode offset (e.g. an operand of a guarded
    /// operation).
    Type {
        /// Correlation id of the observing invocation.
        id: CorrelationId,
        /// Bytecode offset of the observation.
        offset: u32,
        /// The observed type.
        ty: ObjRef,
        /// Concreteness of the observed value.
        concrete: bool,
    },
    /// The code object a callsite invoked.
    Invoke {
        /// Correlation id of the *calling* invocation.
        id: CorrelationId,
        /// Bytecode offset of the invocation.
        offset: u32,
        /// The invoked code object.
        code: ObjRef,
    },
    /// Specialized code was entered mid-frame (on-stack replacement).
    Osr {
        /// Correlation id of the crossing invocation.
        id: CorrelationId,
    },
    /// A value observed to be static at an offset (e.g. a lexical that never
    /// changes).
    Static {
        /// Correlation id of the observing invocation.
        id: CorrelationId,
        /// Bytecode offset of the observation.
        offset: u32,
        /// The observed value.
        value: ObjRef,
    },
    /// A frame returned.
    Return {
        /// Correlation id of the returning invocation.
        id: CorrelationId,
        /// Bytecode offset of the return instruction.
        offset: u32,
        /// The type of the returned value, when it was an object.
        ty: Option<ObjRef>,
        /// Concreteness of the returned value.
        concrete: bool,
    },
}

impl LogEvent {
    /// The correlation id every record carries.
    pub fn id(&self) -> CorrelationId {
        match *self {
            LogEvent::Entry { id, .. }
            | LogEvent::Parameter { id, .. }
            | LogEvent::ParameterDecont { id, .. }
            | LogEvent::Type { id, .. }
            | LogEvent::Invoke { id, .. }
            | LogEvent::Osr { id }
            | LogEvent::Static { id, .. }
            | LogEvent::Return { id, .. } => id,
        }
    }
}

/// An append-only buffer of observation records.
///
/// The mutator side appends while running; once sealed and handed to the
/// aggregator the buffer is read-only. One buffer holds one thread's events,
/// in production order.
#[derive(Default)]
pub struct SpeshLog {
    events: Vec<LogEvent>,
}

impl SpeshLog {
    /// An empty log buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn record(&mut self, event: LogEvent) {
        self.events.push(event);
    }

    /// The recorded events, in production order.
    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
