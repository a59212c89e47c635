//! Pairwise transformation of concurrent operations.

use super::operation::{split_remainders, Operation, TextOperation};
use super::{OtError, OtResult};

/// Transform two operations built against the same document into a pair
/// `(a', b')` such that `apply(apply(S, a), b') == apply(apply(S, b), a')`.
///
/// When both sides insert at the same position, `a`'s text is placed first.
/// Server and clients always pass the client's own operation as `a` so every
/// replica breaks insertion ties the same way.
pub fn transform(a: &TextOperation, b: &TextOperation) -> OtResult<(TextOperation, TextOperation)> {
    if a.base_len() != b.base_len() {
        return Err(OtError::IncompatibleBase {
            left: a.base_len(),
            right: b.base_len(),
        });
    }

    let mut a_prime = TextOperation::new();
    let mut b_prime = TextOperation::new();

    let mut ops_a = a.components().iter().cloned();
    let mut ops_b = b.components().iter().cloned();
    let mut op_a = ops_a.next();
    let mut op_b = ops_b.next();

    loop {
        match (op_a.take(), op_b.take()) {
            (None, None) => break,

            (Some(Operation::Insert(s)), pending) => {
                b_prime.retain(s.chars().count());
                a_prime.insert(&s);
                op_a = ops_a.next();
                op_b = pending;
            }
            (pending, Some(Operation::Insert(s))) => {
                a_prime.retain(s.chars().count());
                b_prime.insert(&s);
                op_a = pending;
                op_b = ops_b.next();
            }

            (None, Some(_)) => return Err(OtError::TooShort),
            (Some(_), None) => return Err(OtError::TooLong),

            (Some(Operation::Retain(i)), Some(Operation::Retain(j))) => {
                let min = i.min(j);
                a_prime.retain(min);
                b_prime.retain(min);
                (op_a, op_b) = split_remainders(i, j, Operation::Retain, Operation::Retain);
            }
            // Both sides removed the span already
            (Some(Operation::Delete(i)), Some(Operation::Delete(j))) => {
                (op_a, op_b) = split_remainders(i, j, Operation::Delete, Operation::Delete);
            }
            (Some(Operation::Delete(i)), Some(Operation::Retain(j))) => {
                a_prime.delete(i.min(j));
                (op_a, op_b) = split_remainders(i, j, Operation::Delete, Operation::Retain);
            }
            (Some(Operation::Retain(i)), Some(Operation::Delete(j))) => {
                b_prime.delete(i.min(j));
                (op_a, op_b) = split_remainders(i, j, Operation::Retain, Operation::Delete);
            }
        }

        if op_a.is_none() {
            op_a = ops_a.next();
        }
        if op_b.is_none() {
            op_b = ops_b.next();
        }
    }

    Ok((a_prime, b_prime))
}
