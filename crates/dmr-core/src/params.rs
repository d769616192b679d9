use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::error::{Error, Result};

/// An ordered mapping from parameter name to [`ParamValue`].
///
/// Keys are always held in sorted order (a `BTreeMap`), which is what makes
/// the canonical serialization used for task signatures deterministic
/// regardless of the order parameters were added in.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A JSON-typed parameter value: scalars (string, 64-bit integer, decimal,
/// boolean), ordered lists that may mix element types, and nested maps
/// ordered by key.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Decimal(Decimal),
    Bool(bool),
    List(Vec<ParamValue>),
    Map(ParamMap),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<Decimal> for ParamValue {
    fn from(value: Decimal) -> Self {
        ParamValue::Decimal(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Builds a [`ParamMap`] one entry at a time, rejecting duplicate keys at the
/// same level.
#[derive(Default, Debug, Clone)]
pub struct ParamsBuilder {
    map: ParamMap,
}

impl ParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Result<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Result<()> {
        let key = key.into();
        if self.map.contains_key(&key) {
            return Err(Error::invalid_argument(format!(
                "duplicate parameter key `{key}`"
            )));
        }

        self.map.insert(key, value.into());
        Ok(())
    }

    pub fn build(self) -> ParamMap {
        self.map
    }
}

/// Builds a map-typed [`ParamValue`], used for nested maps.
///
/// Identical duplicate-key semantics to [`ParamsBuilder`], but produces a
/// [`ParamValue::Map`] instead of a bare [`ParamMap`].
#[derive(Default, Debug, Clone)]
pub struct MapBuilder(ParamsBuilder);

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Result<Self> {
        self.0.insert(key, value)?;
        Ok(self)
    }

    pub fn build(self) -> ParamValue {
        ParamValue::Map(self.0.build())
    }
}

/// Builds a list-typed [`ParamValue`] preserving insertion order. Unlike maps,
/// lists may freely mix element types.
#[derive(Default, Debug, Clone)]
pub struct ListBuilder(Vec<ParamValue>);

impl ListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, value: impl Into<ParamValue>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn build(self) -> ParamValue {
        ParamValue::List(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_keys() {
        let err = ParamsBuilder::new()
            .set("entityId", 100_i64)
            .unwrap()
            .set("entityId", 200_i64)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn nested_map_rejects_duplicates_independently_of_parent() {
        let nested = MapBuilder::new()
            .set("a", 1_i64)
            .unwrap()
            .set("a", 2_i64);
        assert!(nested.is_err());
    }

    #[test]
    fn list_allows_heterogeneous_elements_in_insertion_order() {
        let list = ListBuilder::new().push(1_i64).push("two").push(true).build();
        match list {
            ParamValue::List(items) => {
                assert_eq!(
                    items,
                    vec![
                        ParamValue::Int(1),
                        ParamValue::String("two".into()),
                        ParamValue::Bool(true),
                    ]
                );
            }
            _ => panic!("expected a list"),
        }
    }

    #[test]
    fn map_is_sorted_by_key_regardless_of_insertion_order() {
        let map = ParamsBuilder::new()
            .set("zeta", 1_i64)
            .unwrap()
            .set("alpha", 2_i64)
            .unwrap()
            .build();

        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }
}
