//! Plain-text rendering of statistics trees.
//!
//! Debug output only; the format is for humans reading a spesh trace and is
//! not stable.

use crate::entities::StaticFrame;
use crate::stats::{ObsType, SpeshStats};
use core::fmt::Write;

/// Render `stats` for `frame` as an indented report.
pub fn dump_stats(frame: StaticFrame, stats: &SpeshStats) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{frame}: {} hits, {} OSR hits, version {}",
        stats.hits, stats.osr_hits, stats.last_update
    );
    for sv in &stats.static_values {
        let _ = writeln!(out, "  static {} @ {}", sv.value, sv.offset);
    }
    for by_cs in &stats.by_callsite {
        match by_cs.callsite {
            Some(cs) => {
                let _ = writeln!(
                    out,
                    "  callsite {cs}: {} hits, {} OSR hits, max depth {}",
                    by_cs.hits, by_cs.osr_hits, by_cs.max_depth
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "  no callsite: {} hits, {} OSR hits, max depth {}",
                    by_cs.hits, by_cs.osr_hits, by_cs.max_depth
                );
            }
        }
        for by_type in &by_cs.by_type {
            let _ = write!(out, "    tuple ");
            write_tuple(&mut out, &by_type.arg_types);
            let _ = writeln!(
                out,
                ": {} hits, {} OSR hits, max depth {}",
                by_type.hits, by_type.osr_hits, by_type.max_depth
            );
            for by_offset in &by_type.by_offset {
                let _ = write!(out, "      @ {}:", by_offset.offset);
                for tc in &by_offset.types {
                    let _ = write!(
                        out,
                        " type {} ({}) x{}",
                        tc.ty,
                        concreteness(tc.concrete),
                        tc.count
                    );
                }
                for vc in &by_offset.values {
                    let _ = write!(out, " value {} x{}", vc.value, vc.count);
                }
                for tt in &by_offset.type_tuples {
                    let _ = write!(out, " invoked {} with ", tt.callsite);
                    write_tuple(&mut out, &tt.arg_types);
                    let _ = write!(out, " x{}", tt.count);
                }
                let _ = writeln!(out);
            }
        }
    }
    out
}

fn write_tuple(out: &mut String, tuple: &[ObsType]) {
    let _ = write!(out, "(");
    for (i, obs) in tuple.iter().enumerate() {
        if i > 0 {
            let _ = write!(out, ", ");
        }
        match obs.ty {
            Some(ty) => {
                let _ = write!(out, "{} ({})", ty, concreteness(obs.ty_concrete));
                if let Some(decont) = obs.decont_ty {
                    let _ = write!(out, " of {} ({})", decont, concreteness(obs.decont_concrete));
                }
            }
            None => {
                let _ = write!(out, "-");
            }
        }
    }
    let _ = write!(out, ")");
}

fn concreteness(concrete: bool) -> &'static str {
    if concrete {
        "conc"
    } else {
        "type obj"
    }
}
