//! Callsite descriptors.
//!
//! A callsite describes the static argument shape of an invocation: how many
//! positional arguments there are, which slots are name/value pairs, and the
//! kind of value each slot carries. The aggregator cares about two things:
//! which slots are object arguments (only those get type observations), and
//! how a runtime argument index maps back to a descriptor flag.

use bitflags::bitflags;

bitflags! {
    /// Kind flags for one argument slot of a callsite.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ArgFlags: u8 {
        /// The slot carries an object; type observations apply to it.
        const OBJ = 1 << 0;
        /// The slot carries a native integer.
        const INT = 1 << 1;
        /// The slot carries a native float.
        const NUM = 1 << 2;
        /// The slot carries a native string.
        const STR = 1 << 3;
        /// The slot is a named argument (its value sits in the second word
        /// of a name/value pair).
        const NAMED = 1 << 4;
        /// The slot is an argument list to be flattened at call time.
        const FLAT = 1 << 5;
    }
}

/// The static argument shape of an invocation site.
#[derive(Clone, Debug)]
pub struct CallsiteData {
    /// Number of positional arguments; these occupy the first argument
    /// slots, one per flag.
    pub num_pos: u32,
    /// One flag set per argument, positionals first.
    pub arg_flags: Vec<ArgFlags>,
}

impl CallsiteData {
    /// A callsite with the given positional count and flags.
    pub fn new(num_pos: u32, arg_flags: Vec<ArgFlags>) -> Self {
        debug_assert!(num_pos as usize <= arg_flags.len());
        Self { num_pos, arg_flags }
    }

    /// A callsite whose arguments are all positional.
    pub fn positional(arg_flags: Vec<ArgFlags>) -> Self {
        Self {
            num_pos: arg_flags.len() as u32,
            arg_flags,
        }
    }

    /// Number of argument flags, and so the length of any type tuple keyed
    /// on this callsite.
    pub fn flag_count(&self) -> u32 {
        self.arg_flags.len() as u32
    }

    /// Whether any slot carries an object argument.
    pub fn has_object_args(&self) -> bool {
        self.arg_flags.iter().any(|f| f.contains(ArgFlags::OBJ))
    }

    /// Map a runtime argument index to the flag index it belongs to.
    ///
    /// Positional arguments map one-to-one. Named arguments follow as
    /// name/value pairs, the value in the second word of each pair; a name
    /// word has no flag of its own and maps to `None`.
    pub fn flag_for_arg(&self, arg_idx: u32) -> Option<u32> {
        if arg_idx < self.num_pos {
            return Some(arg_idx);
        }
        let named = arg_idx - self.num_pos;
        if named % 2 == 1 {
            Some(self.num_pos + named / 2)
        } else {
            None
        }
    }
}
