//! Serde encoding of [`TextOperation`].
//!
//! Human-readable formats (JSON) use the compact three-way array:
//! a positive integer retains, a string inserts, a negative integer deletes.
//!
//! ```text
//! [5, "abc", -2]   // retain 5, insert "abc", delete 2
//! ```
//!
//! Binary formats (bincode) cannot decode untagged mixed arrays, so they get
//! the tagged [`Operation`] sequence instead. Both forms are rebuilt through
//! the coalescing builders on the way in.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::operation::{Operation, TextOperation};

/// Borrowed view of one component in the compact form
enum Compact<'a> {
    Retain(usize),
    Insert(&'a str),
    Delete(usize),
}

impl Serialize for Compact<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Compact::Retain(n) => serializer.serialize_u64(*n as u64),
            Compact::Insert(s) => serializer.serialize_str(s),
            Compact::Delete(n) => serializer.serialize_i64(-(*n as i64)),
        }
    }
}

impl Serialize for TextOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !serializer.is_human_readable() {
            return self.components().serialize(serializer);
        }

        let mut seq = serializer.serialize_seq(Some(self.components().len()))?;
        for op in self.components() {
            let compact = match op {
                Operation::Retain(n) => Compact::Retain(*n),
                Operation::Insert(s) => Compact::Insert(s),
                Operation::Delete(n) => Compact::Delete(*n),
            };
            seq.serialize_element(&compact)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TextOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if !deserializer.is_human_readable() {
            let components = Vec::<Operation>::deserialize(deserializer)?;
            let mut lengths = LengthGuard::default();
            for op in &components {
                lengths.add(op).map_err(de::Error::custom)?;
                match op {
                    Operation::Retain(0) | Operation::Delete(0) => {
                        return Err(de::Error::custom("zero-length component"))
                    }
                    Operation::Insert(s) if s.is_empty() => {
                        return Err(de::Error::custom("empty insert"))
                    }
                    _ => {}
                }
            }
            return Ok(TextOperation::from_components(components));
        }

        deserializer.deserialize_seq(CompactVisitor)
    }
}

struct CompactVisitor;

impl<'de> Visitor<'de> for CompactVisitor {
    type Value = TextOperation;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of non-zero integers and non-empty strings")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut op = TextOperation::new();
        let mut lengths = LengthGuard::default();
        while let Some(component) = seq.next_element::<CompactComponent>()? {
            lengths.add(&component.0).map_err(de::Error::custom)?;
            op.push(component.0);
        }
        Ok(op)
    }
}

/// Running base and target lengths of a decoded sequence. Rejects input
/// whose totals do not fit in `usize` before the builders sum them.
#[derive(Default)]
struct LengthGuard {
    base: usize,
    target: usize,
}

impl LengthGuard {
    fn add(&mut self, op: &Operation) -> Result<(), &'static str> {
        let (base, target) = match op {
            Operation::Retain(n) => (*n, *n),
            Operation::Insert(s) => (0, s.chars().count()),
            Operation::Delete(n) => (*n, 0),
        };
        self.base = self
            .base
            .checked_add(base)
            .ok_or("operation length overflow")?;
        self.target = self
            .target
            .checked_add(target)
            .ok_or("operation length overflow")?;
        Ok(())
    }
}

/// One element of the compact form, validated while decoding
struct CompactComponent(Operation);

impl<'de> Deserialize<'de> for CompactComponent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ComponentVisitor)
    }
}

struct ComponentVisitor;

impl<'de> Visitor<'de> for ComponentVisitor {
    type Value = CompactComponent;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-zero integer or a non-empty string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        if v == 0 {
            return Err(E::custom("zero-length retain"));
        }
        usize::try_from(v)
            .map(|n| CompactComponent(Operation::Retain(n)))
            .map_err(|_| E::custom("retain length out of range"))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        if v >= 0 {
            return self.visit_u64(v as u64);
        }
        usize::try_from(v.unsigned_abs())
            .map(|n| CompactComponent(Operation::Delete(n)))
            .map_err(|_| E::custom("delete length out of range"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if v.is_empty() {
            return Err(E::custom("empty insert"));
        }
        Ok(CompactComponent(Operation::Insert(v.to_string())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        if v.is_empty() {
            return Err(E::custom("empty insert"));
        }
        Ok(CompactComponent(Operation::Insert(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_json_encoding() {
        let mut op = TextOperation::new();
        op.retain(5).insert("abc").delete(2);
        assert_eq!(serde_json::to_string(&op).unwrap(), r#"[5,"abc",-2]"#);
    }

    #[test]
    fn test_compact_json_decoding() {
        let op: TextOperation = serde_json::from_str(r#"[1,-1,"abc"]"#).unwrap();
        let mut expected = TextOperation::new();
        expected.retain(1).delete(1).insert("abc");
        assert_eq!(op, expected);
        assert_eq!(op.base_len(), 2);
        assert_eq!(op.target_len(), 4);
    }

    #[test]
    fn test_decoding_normalizes_adjacent_components() {
        let op: TextOperation = serde_json::from_str(r#"[1,2,"a","b",-1,-1]"#).unwrap();
        assert_eq!(
            op.components(),
            &[
                Operation::Retain(3),
                Operation::Insert("ab".into()),
                Operation::Delete(2)
            ]
        );
    }

    #[test]
    fn test_decoding_rejects_invalid_components() {
        assert!(serde_json::from_str::<TextOperation>("[0]").is_err());
        assert!(serde_json::from_str::<TextOperation>(r#"[""]"#).is_err());
        assert!(serde_json::from_str::<TextOperation>("[1.5]").is_err());
        assert!(serde_json::from_str::<TextOperation>("[true]").is_err());
        assert!(serde_json::from_str::<TextOperation>(r#"{"retain":1}"#).is_err());
    }

    #[test]
    fn test_decoding_rejects_length_overflow() {
        let err = serde_json::from_str::<TextOperation>("[18446744073709551615, 1]").unwrap_err();
        assert!(err.to_string().contains("operation length overflow"));

        let err = serde_json::from_str::<TextOperation>("[-9223372036854775808, 9223372036854775807, -2]")
            .unwrap_err();
        assert!(err.to_string().contains("operation length overflow"));

        let components = vec![Operation::Delete(usize::MAX), Operation::Retain(1)];
        let bytes = bincode::serialize(&components).unwrap();
        assert!(bincode::deserialize::<TextOperation>(&bytes).is_err());
    }

    #[test]
    fn test_empty_operation() {
        let op: TextOperation = serde_json::from_str("[]").unwrap();
        assert!(op.is_noop());
        assert_eq!(serde_json::to_string(&op).unwrap(), "[]");
    }

    #[test]
    fn test_bincode_uses_tagged_form() {
        let mut op = TextOperation::new();
        op.retain(3).insert("漢字").delete(4);

        let bytes = bincode::serialize(&op).unwrap();
        let decoded: TextOperation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.apply("abcdefg").unwrap(), "abc漢字");
    }
}
