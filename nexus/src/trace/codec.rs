//! The Trace Codec (spec.md section 4.7): a closed 63-character alphabet
//! encodes signed integers `>= -1` as one, two, or three base-63 digits,
//! with `.`/`:` as length markers. Grounded directly on
//! `examples/original_source/src/nexus/detail/trace_serialize.cc`, which
//! this module reproduces faithfully rather than reinvents.

use std::fmt;

use crate::function::FunctionDescriptor;
use crate::trace::{Op, Trace};

const ALPHABET: &str = "-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn char_at(i: usize) -> char {
    ALPHABET.as_bytes()[i] as char
}

fn index_of(c: char) -> Option<usize> {
    ALPHABET.find(c)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEnd,
    UnknownChar(char),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "trace string ended mid-value"),
            DecodeError::UnknownChar(c) => write!(f, "trace string has an unrecognized character: {:?}", c),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encodes a flat sequence of `i64`s `>= -1` (spec.md section 4.7). Panics
/// if a value exceeds the representable range (63^3 - 1), matching the
/// original's `CC_ASSERT(false && "data too big")`: that condition means
/// the trace itself is malformed, not a recoverable runtime error.
pub fn encode_seq(data: &[i64]) -> String {
    const CCNT: i64 = 63;
    let mut s = String::new();
    for &raw in data {
        assert!(raw >= -1, "nexus: trace value below -1");
        let mut n = raw + 1;
        if n < CCNT {
            s.push(char_at(n as usize));
        } else if n < CCNT * CCNT {
            s.push('.');
            s.push(char_at((n % CCNT) as usize));
            s.push(char_at((n / CCNT) as usize));
        } else if n < CCNT * CCNT * CCNT {
            s.push(':');
            s.push(char_at((n % CCNT) as usize));
            n /= CCNT;
            s.push(char_at((n % CCNT) as usize));
            s.push(char_at((n / CCNT) as usize));
        } else {
            panic!("nexus: trace value too large to encode");
        }
    }
    s
}

/// Decodes a flat sequence previously produced by `encode_seq`.
pub fn decode_seq(s: &str) -> Result<Vec<i64>, DecodeError> {
    const CCNT: i64 = 63;
    let chars: Vec<char> = s.chars().collect();
    let mut pos = 0;
    let mut out = Vec::new();
    let mut next = |pos: &mut usize| -> Result<char, DecodeError> {
        let c = *chars.get(*pos).ok_or(DecodeError::UnexpectedEnd)?;
        *pos += 1;
        Ok(c)
    };
    let idx = |c: char| -> Result<i64, DecodeError> {
        index_of(c).map(|i| i as i64).ok_or(DecodeError::UnknownChar(c))
    };

    while pos < chars.len() {
        let c = next(&mut pos)?;
        let n = if c == ':' {
            let c1 = next(&mut pos)?;
            let c2 = next(&mut pos)?;
            let c3 = next(&mut pos)?;
            (idx(c3)? * CCNT + idx(c2)?) * CCNT + idx(c1)?
        } else if c == '.' {
            let c1 = next(&mut pos)?;
            let c2 = next(&mut pos)?;
            idx(c2)? * CCNT + idx(c1)?
        } else {
            idx(c)?
        };
        out.push(n - 1);
    }
    Ok(out)
}

/// Flattens a `Trace` into the wire sequence spec.md section 4.7 defines:
/// `[equivalence_index]` then per op `[function_index, return_value_idx,
/// arity, arg_idx_0, .., arg_idx_{arity-1}]`.
pub fn encode_trace(trace: &Trace) -> String {
    let mut data: Vec<i64> = Vec::new();
    data.push(trace.equivalence.map(|i| i as i64).unwrap_or(-1));
    for op in &trace.ops {
        data.push(op.function_index as i64);
        data.push(op.return_value_idx as i64);
        data.push(op.args.len() as i64);
        for &a in &op.args {
            data.push(a as i64);
        }
    }
    encode_seq(&data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceDecodeError {
    Malformed,
    Decode(DecodeError),
}

impl fmt::Display for TraceDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceDecodeError::Malformed => write!(f, "trace string decoded to an incomplete op"),
            TraceDecodeError::Decode(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TraceDecodeError {}

impl From<DecodeError> for TraceDecodeError {
    fn from(e: DecodeError) -> Self {
        TraceDecodeError::Decode(e)
    }
}

/// Reconstructs a `Trace` from a reproduction string. `functions` is only
/// used to validate arity matches the registered function; the on-wire
/// arity is self-describing (spec.md section 4.7 stores `arity` per op), so
/// decoding itself never needs the function list.
pub fn decode_trace(
    s: &str,
    functions: &[FunctionDescriptor],
) -> Result<Trace, TraceDecodeError> {
    let data = decode_seq(s)?;
    let mut iter = data.into_iter();
    let equivalence_raw = iter.next().ok_or(TraceDecodeError::Malformed)?;
    let equivalence = if equivalence_raw < 0 {
        None
    } else {
        Some(equivalence_raw as usize)
    };

    let mut ops = Vec::new();
    loop {
        let function_index = match iter.next() {
            Some(v) => v,
            None => break,
        };
        let return_value_idx = iter.next().ok_or(TraceDecodeError::Malformed)?;
        let arity = iter.next().ok_or(TraceDecodeError::Malformed)?;
        let mut args = Vec::with_capacity(arity.max(0) as usize);
        for _ in 0..arity {
            args.push(iter.next().ok_or(TraceDecodeError::Malformed)? as i32);
        }
        let op = Op {
            function_index: function_index as usize,
            args,
            return_value_idx: return_value_idx as i32,
        };
        if let Some(desc) = functions.get(op.function_index) {
            assert_eq!(
                desc.arity(),
                op.args.len(),
                "nexus: decoded trace arity mismatch for `{}`",
                desc.name
            );
        }
        ops.push(op);
    }

    Ok(Trace { equivalence, ops })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_values() {
        let data = vec![-1, 0, 1, 62];
        let s = encode_seq(&data);
        assert_eq!(decode_seq(&s).unwrap(), data);
    }

    #[test]
    fn round_trips_two_digit_values() {
        let data = vec![63, 100, 62 * 63 + 62 - 1];
        let s = encode_seq(&data);
        assert_eq!(decode_seq(&s).unwrap(), data);
    }

    #[test]
    fn round_trips_three_digit_values() {
        let data = vec![63 * 63, 63 * 63 * 10 + 5];
        let s = encode_seq(&data);
        assert_eq!(decode_seq(&s).unwrap(), data);
    }

    #[test]
    fn trace_round_trips_through_wire_format() {
        let mut t = Trace::new();
        t.record_op(0, vec![], 0);
        t.record_op(2, vec![0, 0], 1);
        let s = encode_trace(&t);
        let back = decode_trace(&s, &[]).unwrap();
        assert_eq!(back.equivalence, None);
        assert_eq!(back.ops, t.ops);
    }

    #[test]
    fn equivalence_index_round_trips() {
        let t = Trace::for_equivalence(3);
        let s = encode_trace(&t);
        let back = decode_trace(&s, &[]).unwrap();
        assert_eq!(back.equivalence, Some(3));
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(decode_seq("?").is_err());
    }
}
