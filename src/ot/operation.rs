//! Edit primitives and the text operation built from them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::{OtError, OtResult};

/// One atomic edit primitive.
///
/// Lengths count chars (Unicode scalar values), never bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Skip `n` chars unchanged
    Retain(usize),
    /// Insert the literal at the current cursor
    Insert(String),
    /// Remove `n` chars
    Delete(usize),
}

/// An ordered, length-checked sequence of [`Operation`]s taking a document of
/// `base_len` chars to one of `target_len` chars.
///
/// Adjacent components are never of the same kind: the builders coalesce
/// them, so the representation is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextOperation {
    components: Vec<Operation>,
    base_len: usize,
    target_len: usize,
}

impl TextOperation {
    /// Create an empty operation (applies to the empty string)
    pub fn new() -> Self {
        Self::default()
    }

    /// An operation that keeps a document of `len` chars unchanged
    pub fn identity(len: usize) -> Self {
        let mut op = Self::new();
        op.retain(len);
        op
    }

    /// Build an operation from components, coalescing as it goes
    pub fn from_components(components: impl IntoIterator<Item = Operation>) -> Self {
        components.into_iter().collect()
    }

    /// The components, in scan order
    pub fn components(&self) -> &[Operation] {
        &self.components
    }

    /// Required length of the string this operation applies to
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the string this operation produces
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// Append a component through the matching builder
    pub fn push(&mut self, op: Operation) -> &mut Self {
        match op {
            Operation::Retain(n) => self.retain(n),
            Operation::Insert(s) => self.insert(&s),
            Operation::Delete(n) => self.delete(n),
        }
    }

    /// Skip over `n` chars
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;

        if let Some(Operation::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Operation::Retain(n));
        }
        self
    }

    /// Insert `text` at the current position
    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += text.chars().count();

        if let Some(Operation::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
        } else {
            self.components.push(Operation::Insert(text.to_string()));
        }
        self
    }

    /// Delete `n` chars at the current position
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;

        if let Some(Operation::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Operation::Delete(n));
        }
        self
    }

    /// True when applying this operation cannot change anything
    pub fn is_noop(&self) -> bool {
        matches!(self.components.as_slice(), [] | [Operation::Retain(_)])
    }

    /// Apply the operation to `text` in a single forward pass.
    pub fn apply(&self, text: &str) -> OtResult<String> {
        let length = text.chars().count();
        if length != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: length,
            });
        }

        let mut output = String::with_capacity(text.len());
        // Byte offset and char position of the cursor into `text`
        let mut cursor = 0;
        let mut position = 0;

        for op in &self.components {
            match op {
                Operation::Retain(n) => {
                    let end = advance_chars(text, cursor, *n).ok_or(OtError::Overrun { position })?;
                    output.push_str(&text[cursor..end]);
                    cursor = end;
                    position += n;
                }
                Operation::Insert(s) => output.push_str(s),
                Operation::Delete(n) => {
                    cursor = advance_chars(text, cursor, *n).ok_or(OtError::Overrun { position })?;
                    position += n;
                }
            }
        }

        if cursor != text.len() {
            return Err(OtError::Underrun { position, length });
        }

        Ok(output)
    }

    /// Merge `self` followed by `other` into a single operation, such that
    /// `apply(apply(S, self), other) == apply(S, self.compose(other))`.
    pub fn compose(&self, other: &TextOperation) -> OtResult<TextOperation> {
        if self.target_len != other.base_len {
            return Err(OtError::IncompatibleLengths {
                target: self.target_len,
                base: other.base_len,
            });
        }

        let mut composed = TextOperation::new();
        let mut first = self.components.iter().cloned();
        let mut second = other.components.iter().cloned();
        let mut a = first.next();
        let mut b = second.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,

                // Deletes from the first side never reach the second
                (Some(Operation::Delete(n)), pending) => {
                    composed.delete(n);
                    a = first.next();
                    b = pending;
                }
                // Inserts from the second side never read the first side's output
                (pending, Some(Operation::Insert(s))) => {
                    composed.insert(&s);
                    a = pending;
                    b = second.next();
                }

                (None, Some(_)) => {
                    return Err(OtError::IncompatibleOperations(
                        "first operation ended before the second".to_string(),
                    ))
                }
                (Some(_), None) => {
                    return Err(OtError::IncompatibleOperations(
                        "second operation ended before the first".to_string(),
                    ))
                }

                (Some(Operation::Retain(i)), Some(Operation::Retain(j))) => {
                    composed.retain(i.min(j));
                    (a, b) = split_remainders(i, j, Operation::Retain, Operation::Retain);
                    a = a.or_else(|| first.next());
                    b = b.or_else(|| second.next());
                }
                (Some(Operation::Retain(i)), Some(Operation::Delete(j))) => {
                    composed.delete(i.min(j));
                    (a, b) = split_remainders(i, j, Operation::Retain, Operation::Delete);
                    a = a.or_else(|| first.next());
                    b = b.or_else(|| second.next());
                }
                (Some(Operation::Insert(s)), Some(Operation::Retain(j))) => {
                    let len = s.chars().count();
                    match len.cmp(&j) {
                        Ordering::Less => {
                            composed.insert(&s);
                            a = first.next();
                            b = Some(Operation::Retain(j - len));
                        }
                        Ordering::Equal => {
                            composed.insert(&s);
                            a = first.next();
                            b = second.next();
                        }
                        Ordering::Greater => {
                            let (head, tail) = split_at_char(&s, j);
                            composed.insert(head);
                            a = Some(Operation::Insert(tail.to_string()));
                            b = second.next();
                        }
                    }
                }
                (Some(Operation::Insert(s)), Some(Operation::Delete(j))) => {
                    let len = s.chars().count();
                    match len.cmp(&j) {
                        Ordering::Less => {
                            a = first.next();
                            b = Some(Operation::Delete(j - len));
                        }
                        Ordering::Equal => {
                            a = first.next();
                            b = second.next();
                        }
                        Ordering::Greater => {
                            let (_, tail) = split_at_char(&s, j);
                            a = Some(Operation::Insert(tail.to_string()));
                            b = second.next();
                        }
                    }
                }
            }
        }

        Ok(composed)
    }
}

impl FromIterator<Operation> for TextOperation {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        let mut op = TextOperation::new();
        for component in iter {
            op.push(component);
        }
        op
    }
}

/// Consume `min(i, j)` from two numeric components and return whatever is
/// left of the longer one, rebuilt with its own constructor.
pub(crate) fn split_remainders(
    i: usize,
    j: usize,
    left: fn(usize) -> Operation,
    right: fn(usize) -> Operation,
) -> (Option<Operation>, Option<Operation>) {
    match i.cmp(&j) {
        Ordering::Less => (None, Some(right(j - i))),
        Ordering::Equal => (None, None),
        Ordering::Greater => (Some(left(i - j)), None),
    }
}

/// Byte offset reached after moving `n` chars forward from byte offset `from`,
/// or `None` if fewer than `n` chars remain.
fn advance_chars(text: &str, from: usize, n: usize) -> Option<usize> {
    let rest = &text[from..];
    match rest.char_indices().nth(n) {
        Some((offset, _)) => Some(from + offset),
        None if rest.chars().count() == n => Some(text.len()),
        None => None,
    }
}

fn split_at_char(s: &str, n: usize) -> (&str, &str) {
    let idx = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    s.split_at(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::testing::{random_operation, random_string};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_lengths() {
        let mut op = TextOperation::new();
        assert_eq!((op.base_len(), op.target_len()), (0, 0));
        op.retain(5);
        assert_eq!((op.base_len(), op.target_len()), (5, 5));
        op.insert("abc");
        assert_eq!((op.base_len(), op.target_len()), (5, 8));
        op.retain(2);
        assert_eq!((op.base_len(), op.target_len()), (7, 10));
        op.delete(2);
        assert_eq!((op.base_len(), op.target_len()), (9, 10));
    }

    #[test]
    fn test_empty_arguments_are_ignored() {
        let mut op = TextOperation::new();
        op.retain(0).insert("").delete(0);
        assert!(op.components().is_empty());
        assert_eq!(op, TextOperation::new());
    }

    #[test]
    fn test_adjacent_components_coalesce() {
        let mut op = TextOperation::new();
        op.retain(2).retain(3);
        assert_eq!(op.components(), &[Operation::Retain(5)]);

        op.insert("abc").insert("xyz");
        assert_eq!(op.components().last(), Some(&Operation::Insert("abcxyz".into())));

        op.delete(1).delete(1);
        assert_eq!(op.components().len(), 3);
        assert_eq!(op.components().last(), Some(&Operation::Delete(2)));
    }

    #[test]
    fn test_equal_after_coalescing() {
        let mut a = TextOperation::new();
        a.delete(1).insert("lo").retain(2).retain(3);
        let b = TextOperation::from_components([
            Operation::Delete(1),
            Operation::Insert("l".into()),
            Operation::Insert("o".into()),
            Operation::Retain(5),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_is_noop() {
        let mut op = TextOperation::new();
        assert!(op.is_noop());
        op.retain(5);
        assert!(op.is_noop());
        op.retain(3);
        assert!(op.is_noop());
        op.insert("lorem");
        assert!(!op.is_noop());

        let mut delete_only = TextOperation::new();
        delete_only.delete(1);
        assert!(!delete_only.is_noop());
    }

    #[test]
    fn test_apply_basic() {
        let mut op = TextOperation::new();
        op.retain(6).delete(5).insert("rust");
        assert_eq!(op.apply("hello world").unwrap(), "hello rust");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let mut op = TextOperation::new();
        op.retain(1).insert("ß").delete(1).retain(1);
        assert_eq!(op.apply("é漢a").unwrap(), "éßa");
    }

    #[test]
    fn test_apply_identity() {
        for text in ["", "a", "hello", "漢字テキスト"] {
            let op = TextOperation::identity(text.chars().count());
            assert_eq!(op.apply(text).unwrap(), text);
        }
    }

    #[test]
    fn test_apply_length_mismatch() {
        let mut op = TextOperation::new();
        op.retain(3).insert("x");
        assert_eq!(
            op.apply("ab"),
            Err(OtError::LengthMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert!(matches!(op.apply("abcd"), Err(OtError::LengthMismatch { .. })));
    }

    #[test]
    fn test_apply_target_length() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let text = random_string(&mut rng, 40);
            let op = random_operation(&mut rng, &text);
            assert_eq!(op.base_len(), text.chars().count());
            let applied = op.apply(&text).unwrap();
            assert_eq!(applied.chars().count(), op.target_len());
        }
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let text = random_string(&mut rng, 20);
            let a = random_operation(&mut rng, &text);
            let after_a = a.apply(&text).unwrap();
            let b = random_operation(&mut rng, &after_a);
            let after_b = b.apply(&after_a).unwrap();

            let ab = a.compose(&b).unwrap();
            assert_eq!(ab.base_len(), a.base_len());
            assert_eq!(ab.target_len(), b.target_len());
            assert_eq!(ab.apply(&text).unwrap(), after_b);
        }
    }

    #[test]
    fn test_compose_rejects_unchained_lengths() {
        let a = TextOperation::identity(3);
        let b = TextOperation::identity(4);
        assert_eq!(
            a.compose(&b),
            Err(OtError::IncompatibleLengths { target: 3, base: 4 })
        );
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let mut a = TextOperation::new();
        a.retain(2).insert("xyz");
        let mut b = TextOperation::new();
        b.retain(2).delete(3);
        let ab = a.compose(&b).unwrap();
        assert!(ab.is_noop());
        assert_eq!(ab.apply("ab").unwrap(), "ab");
    }
}
