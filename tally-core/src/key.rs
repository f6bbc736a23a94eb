//! Canonical cache keys.
//!
//! A [`CacheKey`] is an operation name plus a canonical parameter tuple.
//! Parameters are held in a sorted map, so two call sites that pass the same
//! fields in a different order always produce the same key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::KeyError;

/// Name of a registered read operation, e.g. `list-vouchers`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationName(String);

impl OperationName {
    /// Validate and wrap an operation name.
    ///
    /// Names must be non-empty and contain no whitespace or control
    /// characters.
    pub fn new(name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(KeyError::EmptyOperation);
        }
        if let Some(c) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(KeyError::InvalidOperation {
                reason: format!("contains forbidden character {:?}", c),
                name,
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OperationName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single parameter value.
///
/// Floating point values are deliberately absent: they have no total order
/// and would make key equality unreliable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Id(Uuid),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Id(id) => write!(f, "{}", id),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<Uuid> for ParamValue {
    fn from(v: Uuid) -> Self {
        Self::Id(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Canonical parameter tuple.
///
/// Only constructible through [`Params::builder`], [`Params::from_json`] or
/// [`Params::empty`], all of which canonicalize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params {
    fields: BTreeMap<String, ParamValue>,
}

impl Params {
    /// Parameters with no fields.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> ParamsBuilder {
        ParamsBuilder::default()
    }

    /// Canonicalize parameters from a JSON object.
    ///
    /// `null` fields are treated as absent so that `{entity: "E1", page: null}`
    /// and `{entity: "E1"}` produce the same key. Floats, arrays and nested
    /// objects are rejected.
    pub fn from_json(value: &Value) -> Result<Self, KeyError> {
        let object = match value {
            Value::Null => return Ok(Self::empty()),
            Value::Object(object) => object,
            Value::Array(_) => return Err(KeyError::NotAnObject { kind: "array".into() }),
            Value::String(_) => return Err(KeyError::NotAnObject { kind: "string".into() }),
            Value::Number(_) => return Err(KeyError::NotAnObject { kind: "number".into() }),
            Value::Bool(_) => return Err(KeyError::NotAnObject { kind: "bool".into() }),
        };

        let mut builder = Self::builder();
        for (name, field) in object {
            let value = match field {
                Value::Null => continue,
                Value::Bool(b) => ParamValue::Bool(*b),
                Value::String(s) => ParamValue::Text(s.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => ParamValue::Int(i),
                    None => {
                        return Err(KeyError::UnsupportedValue {
                            name: name.clone(),
                            reason: format!("non-integer number {}", n),
                        })
                    }
                },
                Value::Array(_) | Value::Object(_) => {
                    return Err(KeyError::UnsupportedValue {
                        name: name.clone(),
                        reason: "nested values cannot be part of a cache key".into(),
                    })
                }
            };
            builder = builder.param(name.as_str(), value);
        }
        builder.build()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True if every field of `other` is present in `self` with an equal value.
    pub fn contains_all(&self, other: &Params) -> bool {
        other
            .fields
            .iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        f.write_str("}")
    }
}

/// Collects raw parameter pairs and canonicalizes them on [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct ParamsBuilder {
    pairs: Vec<(String, ParamValue)>,
}

impl ParamsBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.pairs.push((name.into(), value.into()));
        self
    }

    /// Sort and deduplicate the collected fields.
    ///
    /// A field supplied twice with the same value is accepted; with different
    /// values it is a [`KeyError::ConflictingParam`].
    pub fn build(self) -> Result<Params, KeyError> {
        let mut fields = BTreeMap::new();
        for (name, value) in self.pairs {
            if name.is_empty() {
                return Err(KeyError::EmptyParamName);
            }
            match fields.get(&name) {
                Some(existing) if *existing != value => {
                    return Err(KeyError::ConflictingParam { name });
                }
                Some(_) => {}
                None => {
                    fields.insert(name, value);
                }
            }
        }
        Ok(Params { fields })
    }
}

/// Canonical identifier for a logical resource fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    operation: OperationName,
    params: Params,
}

impl CacheKey {
    /// Build a key, validating the operation name.
    pub fn new(operation: impl Into<String>, params: Params) -> Result<Self, KeyError> {
        Ok(Self {
            operation: OperationName::new(operation)?,
            params,
        })
    }

    pub fn from_parts(operation: OperationName, params: Params) -> Self {
        Self { operation, params }
    }

    pub fn operation(&self) -> &OperationName {
        &self.operation
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operation, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_does_not_matter() {
        let a = Params::builder()
            .param("entity", "E1")
            .param("principal", "alice")
            .build()
            .unwrap();
        let b = Params::builder()
            .param("principal", "alice")
            .param("entity", "E1")
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(
            CacheKey::new("list-vouchers", a).unwrap(),
            CacheKey::new("list-vouchers", b).unwrap()
        );
    }

    #[test]
    fn test_duplicate_same_value_is_accepted() {
        let params = Params::builder()
            .param("entity", "E1")
            .param("entity", "E1")
            .build()
            .unwrap();
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_duplicate_conflicting_value_is_rejected() {
        let err = Params::builder()
            .param("entity", "E1")
            .param("entity", "E2")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            KeyError::ConflictingParam {
                name: "entity".to_string()
            }
        );
    }

    #[test]
    fn test_empty_param_name_is_rejected() {
        let err = Params::builder().param("", 1i64).build().unwrap_err();
        assert_eq!(err, KeyError::EmptyParamName);
    }

    #[test]
    fn test_operation_name_validation() {
        assert_eq!(OperationName::new("").unwrap_err(), KeyError::EmptyOperation);
        assert!(matches!(
            OperationName::new("list vouchers"),
            Err(KeyError::InvalidOperation { .. })
        ));
        assert!(OperationName::new("list-vouchers").is_ok());
    }

    #[test]
    fn test_from_json_skips_nulls() {
        let a = Params::from_json(&json!({"entity": "E1", "page": null})).unwrap();
        let b = Params::from_json(&json!({"entity": "E1"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_json_rejects_floats_and_nesting() {
        assert!(matches!(
            Params::from_json(&json!({"amount": 1.5})),
            Err(KeyError::UnsupportedValue { .. })
        ));
        assert!(matches!(
            Params::from_json(&json!({"filter": {"status": "open"}})),
            Err(KeyError::UnsupportedValue { .. })
        ));
        assert!(matches!(
            Params::from_json(&json!(["E1"])),
            Err(KeyError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_contains_all() {
        let full = Params::builder()
            .param("entity", "E1")
            .param("status", "open")
            .build()
            .unwrap();
        let partial = Params::builder().param("entity", "E1").build().unwrap();
        let other = Params::builder().param("entity", "E2").build().unwrap();

        assert!(full.contains_all(&partial));
        assert!(full.contains_all(&Params::empty()));
        assert!(!full.contains_all(&other));
        assert!(!partial.contains_all(&full));
    }

    #[test]
    fn test_display() {
        let params = Params::builder()
            .param("status", "open")
            .param("entity", "E1")
            .build()
            .unwrap();
        let key = CacheKey::new("list-vouchers", params).unwrap();
        assert_eq!(key.to_string(), "list-vouchers{entity=E1,status=open}");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn value_strategy() -> impl Strategy<Value = ParamValue> {
        prop_oneof![
            any::<bool>().prop_map(ParamValue::Bool),
            any::<i64>().prop_map(ParamValue::Int),
            any::<[u8; 16]>().prop_map(|b| ParamValue::Id(Uuid::from_bytes(b))),
            "[a-zA-Z0-9_-]{0,12}".prop_map(ParamValue::Text),
        ]
    }

    fn fields_strategy() -> impl Strategy<Value = BTreeMap<String, ParamValue>> {
        prop::collection::btree_map("[a-z_]{1,8}", value_strategy(), 0..6)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: any permutation of the same fields canonicalizes to the same params.
        #[test]
        fn prop_permutation_invariant(fields in fields_strategy(), seed in any::<u64>()) {
            let mut pairs: Vec<_> = fields.into_iter().collect();
            let forward = pairs
                .iter()
                .fold(Params::builder(), |b, (k, v)| b.param(k.clone(), v.clone()))
                .build()
                .expect("forward build should succeed");

            // Deterministic shuffle driven by the seed.
            let len = pairs.len();
            if len > 1 {
                let mut s = seed;
                for i in (1..len).rev() {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (s % (i as u64 + 1)) as usize;
                    pairs.swap(i, j);
                }
            }
            let shuffled = pairs
                .into_iter()
                .fold(Params::builder(), |b, (k, v)| b.param(k, v))
                .build()
                .expect("shuffled build should succeed");

            prop_assert_eq!(forward, shuffled);
        }

        /// Property: canonical params always contain themselves and the empty tuple.
        #[test]
        fn prop_contains_all_reflexive(fields in fields_strategy()) {
            let params = fields
                .into_iter()
                .fold(Params::builder(), |b, (k, v)| b.param(k, v))
                .build()
                .expect("build should succeed");
            prop_assert!(params.contains_all(&params));
            prop_assert!(params.contains_all(&Params::empty()));
        }

        /// Property: JSON serialization of params is stable across equal values.
        #[test]
        fn prop_equal_params_serialize_identically(fields in fields_strategy()) {
            let a = fields
                .clone()
                .into_iter()
                .fold(Params::builder(), |b, (k, v)| b.param(k, v))
                .build()
                .expect("build should succeed");
            let b = fields
                .into_iter()
                .rev()
                .fold(Params::builder(), |b, (k, v)| b.param(k, v))
                .build()
                .expect("build should succeed");
            prop_assert_eq!(
                serde_json::to_vec(&a).expect("serialize"),
                serde_json::to_vec(&b).expect("serialize")
            );
        }
    }
}
