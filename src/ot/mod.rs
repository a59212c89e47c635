//! Operational transformation engine for plain text.
//!
//! A [`TextOperation`] is a left-to-right scan over a base string made of
//! retain, insert and delete components. Two operations built against the
//! same document snapshot can be reconciled with [`transform`] so that
//! applying them in either order converges to the same text:
//!
//! ```text
//! apply(apply(S, A), B') == apply(apply(S, B), A')
//! ```
//!
//! Everything in this module is pure computation: no locking, no I/O.

pub mod operation;
pub mod transform;
pub mod wire;

pub use operation::{Operation, TextOperation};
pub use transform::transform;

use thiserror::Error;

/// Result type for OT computations
pub type OtResult<T> = Result<T, OtError>;

/// Contract violations raised by `apply`, `compose` and `transform`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The string's length does not match the operation's base length
    #[error("length mismatch: operation expects {expected} chars, string has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A retain reached past the end of the input
    #[error("operation overruns the input string at char {position}")]
    Overrun { position: usize },

    /// The operation finished before consuming the whole input
    #[error("operation stopped at char {position} of {length}")]
    Underrun { position: usize, length: usize },

    /// Two concurrent operations were not built against the same base length
    #[error("incompatible base lengths: {left} vs {right}")]
    IncompatibleBase { left: usize, right: usize },

    /// Two consecutive operations do not chain (target length != next base length)
    #[error("incompatible lengths: first produces {target} chars, second expects {base}")]
    IncompatibleLengths { target: usize, base: usize },

    /// The component sequences cannot be paired
    #[error("incompatible operations: {0}")]
    IncompatibleOperations(String),

    /// The first operation ran out of components before the second
    #[error("first operation is too short")]
    TooShort,

    /// The first operation has components left after the second ran out
    #[error("first operation is too long")]
    TooLong,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Random document and operation generators shared by the OT tests.

    use super::TextOperation;
    use rand::Rng;

    const ALPHABET: &[char] = &['a', 'b', 'c', 'x', 'y', 'z', ' ', '\n', 'é', '漢'];

    pub fn random_string<R: Rng>(rng: &mut R, max_len: usize) -> String {
        let len = rng.gen_range(0..=max_len);
        (0..len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
            .collect()
    }

    /// Build a random operation applicable to `base`.
    pub fn random_operation<R: Rng>(rng: &mut R, base: &str) -> TextOperation {
        let mut op = TextOperation::new();
        let mut remaining = base.chars().count();

        while remaining > 0 {
            let span = rng.gen_range(1..=remaining.min(5));
            match rng.gen_range(0..3) {
                0 => op.retain(span),
                1 => op.delete(span),
                _ => {
                    op.insert(&random_string(rng, 4));
                    op.retain(span)
                }
            };
            remaining -= span;
        }

        if rng.gen_bool(0.3) {
            op.insert(&random_string(rng, 3));
        }

        op
    }
}
