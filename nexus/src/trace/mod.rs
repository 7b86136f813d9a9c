//! Trace recording and minimization (spec.md section 4.6). A `Trace` is the
//! op-by-op record of one Machine run: which function fired, which pool
//! slots it read, and which slot (if any) received its return value.
//!
//! The in-memory shape here (`Op` owning its own `args: Vec<i32>`) differs
//! from the flat `[function_index, args_start_idx, return_value_idx]` plus
//! shared `arg_indices` array spec.md describes: that flat layout is a
//! cache-locality concern from the original C++ implementation, not a
//! contract `nexus` needs to preserve in memory. `trace::codec` produces
//! and consumes exactly that flat layout on the wire, so the serialized
//! format matches spec.md section 4.7 byte-for-byte; only the in-memory
//! representation is more ergonomic.

pub mod codec;
pub mod minimize;

/// One executed operation (spec.md section 4.5 "Tracing").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub function_index: usize,
    pub args: Vec<i32>,
    pub return_value_idx: i32,
}

/// The full record of one Machine run, replayable and minimizable (spec.md
/// sections 4.5–4.7).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    /// `None` selects normal MCT mode; `Some(i)` indexes into the ordered
    /// list of equivalence specs (spec.md section 4.7: "`equivalence_index
    /// = -1` selects normal mode").
    pub equivalence: Option<usize>,
    pub ops: Vec<Op>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    pub fn for_equivalence(index: usize) -> Self {
        Trace {
            equivalence: Some(index),
            ops: Vec::new(),
        }
    }

    pub fn record_op(&mut self, function_index: usize, args: Vec<i32>, return_value_idx: i32) {
        self.ops.push(Op {
            function_index,
            args,
            return_value_idx,
        });
    }

    /// `1 + max(return_value_idx, 0) + Σ arg_index`, summed over all ops
    /// (spec.md section 4.6).
    pub fn complexity(&self) -> i64 {
        self.ops
            .iter()
            .map(|op| {
                1 + op.return_value_idx.max(0) as i64
                    + op.args.iter().map(|&a| a as i64).sum::<i64>()
            })
            .sum()
    }
}

/// Outcome of replaying a trace deterministically against a freshly built
/// Machine (or pair of Machines, for equivalence mode). `Invalid` never
/// escapes this module as a `NexusError` (spec.md section 7: a minimizer
/// proposal that replays invalid is simply discarded, not reported).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed,
    Invalid,
}

/// Whether a replayed trace is worth adopting during minimization: it must
/// not merely complete, it must fail *the same way* (spec.md section 4.6:
/// "if it fails the same way ... adopt it").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimizeVerdict {
    FailsSameWay,
    Passes,
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_sums_per_op_contributions() {
        let mut t = Trace::new();
        t.record_op(0, vec![0, 1], 2);
        t.record_op(1, vec![], -1);
        assert_eq!(t.complexity(), (1 + 2 + (0 + 1)) + (1 + 0 + 0));
    }

    #[test]
    fn empty_trace_has_zero_complexity() {
        assert_eq!(Trace::new().complexity(), 0);
    }
}
