use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::primitive::{Primitive, DOUBLE_TOLERANCE};
use crate::Item;

/// A single condition over one attribute of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionLeaf {
    AttributeExists(String),
    AttributeNotExists(String),
    AttributeEquals(String, Primitive),
    AttributeNotEquals(String, Primitive),
    AttributeGreater(String, Primitive),
    AttributeGreaterOrEqual(String, Primitive),
    AttributeLess(String, Primitive),
    AttributeLessOrEqual(String, Primitive),
    ArrayElementExists(String, Primitive),
    ArrayElementNotExists(String, Primitive),
}

/// A tree of leaf conditions coupled with and/or, gating conditional
/// writes. Backends translate the tree into their native filter language
/// or fall back to [`Condition::evaluate`] under the entity mutex.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Condition {
    #[default]
    Empty,
    Single(ConditionLeaf),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn attribute_exists(name: impl Into<String>) -> Self {
        Condition::Single(ConditionLeaf::AttributeExists(name.into()))
    }

    pub fn attribute_not_exists(name: impl Into<String>) -> Self {
        Condition::Single(ConditionLeaf::AttributeNotExists(name.into()))
    }

    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeEquals(name.into(), value.into()))
    }

    pub fn attribute_not_equals(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeNotEquals(name.into(), value.into()))
    }

    pub fn attribute_greater(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeGreater(name.into(), value.into()))
    }

    pub fn attribute_greater_or_equal(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeGreaterOrEqual(
            name.into(),
            value.into(),
        ))
    }

    pub fn attribute_less(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeLess(name.into(), value.into()))
    }

    pub fn attribute_less_or_equal(name: impl Into<String>, value: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::AttributeLessOrEqual(name.into(), value.into()))
    }

    pub fn array_element_exists(name: impl Into<String>, element: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::ArrayElementExists(
            name.into(),
            element.into(),
        ))
    }

    pub fn array_element_not_exists(name: impl Into<String>, element: impl Into<Primitive>) -> Self {
        Condition::Single(ConditionLeaf::ArrayElementNotExists(
            name.into(),
            element.into(),
        ))
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::Empty)
    }

    /// evaluate is the reference predicate over an item (`None` when the
    /// item does not exist). Value-bearing leaves referencing an absent
    /// attribute evaluate to false, so gated writes fail their
    /// precondition instead of silently succeeding; the not-exists leaves
    /// hold on absence.
    pub fn evaluate(&self, item: Option<&Item>) -> bool {
        match self {
            Condition::Empty => true,
            Condition::Single(leaf) => leaf.evaluate(item),
            Condition::And(a, b) => a.evaluate(item) && b.evaluate(item),
            Condition::Or(a, b) => a.evaluate(item) || b.evaluate(item),
        }
    }
}

impl ConditionLeaf {
    fn evaluate(&self, item: Option<&Item>) -> bool {
        let attr = |name: &str| item.and_then(|i| i.get(name));
        match self {
            ConditionLeaf::AttributeExists(name) => attr(name).is_some(),
            ConditionLeaf::AttributeNotExists(name) => attr(name).is_none(),
            ConditionLeaf::AttributeEquals(name, expected) => {
                attr(name).map(|v| json_eq(v, expected)).unwrap_or(false)
            }
            ConditionLeaf::AttributeNotEquals(name, expected) => {
                attr(name).map(|v| !json_eq(v, expected)).unwrap_or(false)
            }
            ConditionLeaf::AttributeGreater(name, expected) => attr(name)
                .and_then(|v| json_cmp(v, expected))
                .map(|o| o == Ordering::Greater)
                .unwrap_or(false),
            ConditionLeaf::AttributeGreaterOrEqual(name, expected) => attr(name)
                .and_then(|v| json_cmp(v, expected))
                .map(|o| o != Ordering::Less)
                .unwrap_or(false),
            ConditionLeaf::AttributeLess(name, expected) => attr(name)
                .and_then(|v| json_cmp(v, expected))
                .map(|o| o == Ordering::Less)
                .unwrap_or(false),
            ConditionLeaf::AttributeLessOrEqual(name, expected) => attr(name)
                .and_then(|v| json_cmp(v, expected))
                .map(|o| o != Ordering::Greater)
                .unwrap_or(false),
            ConditionLeaf::ArrayElementExists(name, element) => attr(name)
                .and_then(|v| v.as_array())
                .map(|a| a.iter().any(|v| json_eq(v, element)))
                .unwrap_or(false),
            ConditionLeaf::ArrayElementNotExists(name, element) => attr(name)
                .and_then(|v| v.as_array())
                .map(|a| !a.iter().any(|v| json_eq(v, element)))
                .unwrap_or(true),
        }
    }
}

/// json_eq compares a stored JSON value against an expected primitive,
/// honoring the double tolerance and the base64 projection of bytes.
pub fn json_eq(value: &Value, expected: &Primitive) -> bool {
    match expected {
        Primitive::String(s) => value.as_str() == Some(s.as_str()),
        Primitive::Integer(i) => match value {
            Value::Number(n) => {
                n.as_i64() == Some(*i)
                    || n.as_f64()
                        .map(|f| (f - *i as f64).abs() <= DOUBLE_TOLERANCE)
                        .unwrap_or(false)
            }
            _ => false,
        },
        Primitive::Double(d) => value
            .as_f64()
            .map(|f| (f - d).abs() <= DOUBLE_TOLERANCE)
            .unwrap_or(false),
        Primitive::Bytes(b) => value.as_str() == Some(STANDARD.encode(b).as_str()),
    }
}

fn json_cmp(value: &Value, expected: &Primitive) -> Option<Ordering> {
    match expected {
        Primitive::Integer(i) => value.as_f64().map(|f| cmp_tolerant(f, *i as f64)),
        Primitive::Double(d) => value.as_f64().map(|f| cmp_tolerant(f, *d)),
        Primitive::String(s) => value.as_str().map(|v| v.cmp(s.as_str())),
        Primitive::Bytes(b) => {
            let encoded = STANDARD.encode(b);
            value.as_str().map(|v| v.cmp(encoded.as_str()))
        }
    }
}

fn cmp_tolerant(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= DOUBLE_TOLERANCE {
        Ordering::Equal
    } else if a < b {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: Value) -> Item {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn empty_condition_always_holds() {
        assert!(Condition::Empty.evaluate(None));
        assert!(Condition::Empty.evaluate(Some(&item(json!({"A": 1})))));
    }

    #[test]
    fn existence_leaves() {
        let it = item(json!({"Name": "John"}));
        assert!(Condition::attribute_exists("Name").evaluate(Some(&it)));
        assert!(!Condition::attribute_exists("Age").evaluate(Some(&it)));
        assert!(Condition::attribute_not_exists("Age").evaluate(Some(&it)));
        assert!(Condition::attribute_not_exists("Age").evaluate(None));
        assert!(!Condition::attribute_exists("Name").evaluate(None));
    }

    #[test]
    fn value_leaves_fail_on_absent_attribute() {
        let it = item(json!({"Age": 30}));
        assert!(!Condition::attribute_equals("Missing", 1i64).evaluate(Some(&it)));
        assert!(!Condition::attribute_not_equals("Missing", 1i64).evaluate(Some(&it)));
        assert!(!Condition::attribute_greater("Missing", 1i64).evaluate(Some(&it)));
    }

    #[test]
    fn numeric_comparisons() {
        let it = item(json!({"Age": 30}));
        assert!(Condition::attribute_equals("Age", 30i64).evaluate(Some(&it)));
        assert!(Condition::attribute_greater("Age", 29i64).evaluate(Some(&it)));
        assert!(Condition::attribute_greater_or_equal("Age", 30i64).evaluate(Some(&it)));
        assert!(Condition::attribute_less("Age", 31i64).evaluate(Some(&it)));
        assert!(Condition::attribute_less_or_equal("Age", 30i64).evaluate(Some(&it)));
        assert!(!Condition::attribute_less("Age", 30i64).evaluate(Some(&it)));
        assert!(Condition::attribute_equals("Age", 30.0 + 5e-8).evaluate(Some(&it)));
    }

    #[test]
    fn array_element_leaves() {
        let it = item(json!({"Tags": ["a", "b"]}));
        assert!(Condition::array_element_exists("Tags", "a").evaluate(Some(&it)));
        assert!(!Condition::array_element_exists("Tags", "c").evaluate(Some(&it)));
        assert!(Condition::array_element_not_exists("Tags", "c").evaluate(Some(&it)));
        assert!(Condition::array_element_not_exists("Other", "c").evaluate(Some(&it)));
        assert!(Condition::array_element_not_exists("Tags", "x").evaluate(None));
        assert!(!Condition::array_element_exists("Tags", "a").evaluate(None));
    }

    #[test]
    fn coupling() {
        let it = item(json!({"Age": 30, "Name": "John"}));
        let both = Condition::attribute_equals("Age", 30i64)
            .and(Condition::attribute_equals("Name", "John"));
        assert!(both.evaluate(Some(&it)));

        let either = Condition::attribute_equals("Age", 31i64)
            .or(Condition::attribute_equals("Name", "John"));
        assert!(either.evaluate(Some(&it)));

        let neither = Condition::attribute_equals("Age", 31i64)
            .and(Condition::attribute_equals("Name", "John"));
        assert!(!neither.evaluate(Some(&it)));
    }

    #[test]
    fn bytes_compare_against_base64_projection() {
        let it = item(json!({"Blob": "3q0="}));
        assert!(Condition::attribute_equals("Blob", vec![0xde, 0xad]).evaluate(Some(&it)));
    }
}
