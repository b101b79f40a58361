//! Data quanta and slot typing.
//!
//! A `Quantum` is one data unit flowing through a channel. Platforms are free to
//! convert these to their native representation; the core only moves them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Quantum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Quantum>),
    /// Output of grouping operators: all quanta sharing one key.
    Group(Vec<Quantum>),
}

impl Quantum {
    pub fn str(s: impl Into<String>) -> Self {
        Quantum::Str(s.into())
    }

    pub fn pair(a: Quantum, b: Quantum) -> Self {
        Quantum::Tuple(vec![a, b])
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Quantum::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Quantum::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Quantum::Float(f) => Some(*f),
            Quantum::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&[Quantum]> {
        match self {
            Quantum::Group(items) => Some(items),
            _ => None,
        }
    }

    /// Field `idx` of a tuple quantum.
    pub fn field(&self, idx: usize) -> Option<&Quantum> {
        match self {
            Quantum::Tuple(fields) => fields.get(idx),
            _ => None,
        }
    }

    pub fn unit_type(&self) -> DataUnitType {
        match self {
            Quantum::Null => DataUnitType::Any,
            Quantum::Bool(_) => DataUnitType::Bool,
            Quantum::Int(_) => DataUnitType::Int,
            Quantum::Float(_) => DataUnitType::Float,
            Quantum::Str(_) => DataUnitType::Str,
            Quantum::Tuple(_) => DataUnitType::Tuple,
            Quantum::Group(items) => items.first().map(|q| q.unit_type()).unwrap_or(DataUnitType::Any),
        }
    }
}

impl From<&str> for Quantum {
    fn from(s: &str) -> Self {
        Quantum::Str(s.to_string())
    }
}

impl From<String> for Quantum {
    fn from(s: String) -> Self {
        Quantum::Str(s)
    }
}

impl From<i64> for Quantum {
    fn from(i: i64) -> Self {
        Quantum::Int(i)
    }
}

impl From<f64> for Quantum {
    fn from(f: f64) -> Self {
        Quantum::Float(f)
    }
}

impl From<bool> for Quantum {
    fn from(b: bool) -> Self {
        Quantum::Bool(b)
    }
}

impl fmt::Display for Quantum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantum::Null => f.write_str("null"),
            Quantum::Bool(b) => write!(f, "{b}"),
            Quantum::Int(i) => write!(f, "{i}"),
            Quantum::Float(x) => write!(f, "{x}"),
            Quantum::Str(s) => f.write_str(s),
            Quantum::Tuple(items) | Quantum::Group(items) => {
                let open = if matches!(self, Quantum::Tuple(_)) { "(" } else { "[" };
                let close = if matches!(self, Quantum::Tuple(_)) { ")" } else { "]" };
                f.write_str(open)?;
                for (i, q) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{q}")?;
                }
                f.write_str(close)
            }
        }
    }
}

/// Total order so quanta can be sorted, deduplicated, and used as grouping keys.
///
/// Nulls sort first, NaN sorts after every other float, and mixed variants
/// compare by variant order.
impl Ord for Quantum {
    fn cmp(&self, other: &Self) -> Ordering {
        use Quantum::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(x), Bool(y)) => x.cmp(y),
            (Int(x), Int(y)) => x.cmp(y),
            (Float(x), Float(y)) => {
                if x.is_nan() && y.is_nan() {
                    Ordering::Equal
                } else if x.is_nan() {
                    Ordering::Greater
                } else if y.is_nan() {
                    Ordering::Less
                } else {
                    x.partial_cmp(y).unwrap_or(Ordering::Equal)
                }
            }
            (Str(x), Str(y)) => x.cmp(y),
            (Tuple(x), Tuple(y)) | (Group(x), Group(y)) => x.cmp(y),
            _ => variant_order(self).cmp(&variant_order(other)),
        }
    }
}

impl PartialOrd for Quantum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Quantum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Quantum {}

fn variant_order(q: &Quantum) -> u8 {
    use Quantum::*;
    match q {
        Null => 0,
        Bool(_) => 1,
        Int(_) => 2,
        Float(_) => 3,
        Str(_) => 4,
        Tuple(_) => 5,
        Group(_) => 6,
    }
}

/// Logical type of a single data unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataUnitType {
    /// Matches every other unit type.
    Any,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
}

impl DataUnitType {
    pub fn accepts(self, other: DataUnitType) -> bool {
        self == other || self == DataUnitType::Any || other == DataUnitType::Any
    }
}

/// Whether a slot carries individual quanta or groups of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    Single,
    Grouped,
}

/// Type of an operator slot: a unit type plus single/grouped cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotType {
    pub unit: DataUnitType,
    pub cardinality: Cardinality,
}

impl SlotType {
    pub const ANY: SlotType = SlotType::single(DataUnitType::Any);

    pub const fn single(unit: DataUnitType) -> Self {
        Self {
            unit,
            cardinality: Cardinality::Single,
        }
    }

    pub const fn grouped(unit: DataUnitType) -> Self {
        Self {
            unit,
            cardinality: Cardinality::Grouped,
        }
    }

    pub fn is_grouped(&self) -> bool {
        self.cardinality == Cardinality::Grouped
    }

    /// Can data produced with type `self` be consumed by a slot typed `expected`?
    pub fn compatible_with(&self, expected: &SlotType) -> bool {
        self.cardinality == expected.cardinality && self.unit.accepts(expected.unit)
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cardinality {
            Cardinality::Single => write!(f, "{:?}", self.unit),
            Cardinality::Grouped => write!(f, "Group<{:?}>", self.unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_order_is_total() {
        let mut v = vec![
            Quantum::str("b"),
            Quantum::Int(3),
            Quantum::Null,
            Quantum::Float(f64::NAN),
            Quantum::Float(1.5),
            Quantum::str("a"),
        ];
        v.sort();
        assert_eq!(v[0], Quantum::Null);
        assert_eq!(v[1], Quantum::Int(3));
        assert_eq!(v[2], Quantum::Float(1.5));
        assert!(matches!(v[3], Quantum::Float(x) if x.is_nan()));
        assert_eq!(v[4], Quantum::str("a"));
    }

    #[test]
    fn grouped_and_single_slots_do_not_mix() {
        let single = SlotType::single(DataUnitType::Str);
        let grouped = SlotType::grouped(DataUnitType::Str);
        assert!(!single.compatible_with(&grouped));
        assert!(single.compatible_with(&SlotType::ANY));
        assert!(!single.compatible_with(&SlotType::single(DataUnitType::Int)));
    }

    #[test]
    fn quanta_roundtrip_through_json() {
        let q = Quantum::pair(Quantum::str("k"), Quantum::Group(vec![Quantum::Int(1)]));
        let line = serde_json::to_string(&q).unwrap();
        let back: Quantum = serde_json::from_str(&line).unwrap();
        assert_eq!(q, back);
    }
}
