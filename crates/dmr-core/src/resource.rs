use std::borrow::Cow;
use std::fmt;

/// A typed identifier for a lockable object.
///
/// Two keys are equal iff their `kind` and `components` are both equal. Keys
/// are ordered by their natural `(kind, components)` comparison, which the
/// scheduler relies on to acquire a task's resources in a deterministic total
/// order and avoid deadlocks.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceKey {
    kind: Cow<'static, str>,
    components: Vec<String>,
}

impl ResourceKey {
    pub fn new(kind: impl Into<Cow<'static, str>>, components: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            components,
        }
    }

    /// Convenience constructor for a single-component key, e.g. `ENTITY:100`.
    pub fn single(kind: impl Into<Cow<'static, str>>, component: impl Into<String>) -> Self {
        Self::new(kind, vec![component.into()])
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for component in &self.components {
            write!(f, ":{component}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_by_kind_then_components() {
        let a = ResourceKey::single("ENTITY", "1");
        let b = ResourceKey::single("ENTITY", "2");
        let c = ResourceKey::single("RECORD", "1");

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn equality_ignores_construction_path() {
        let a = ResourceKey::new("ENTITY", vec!["100".to_string()]);
        let b = ResourceKey::single("ENTITY", "100");
        assert_eq!(a, b);
    }

    #[test]
    fn display_joins_kind_and_components() {
        let key = ResourceKey::new("MATCH_KEY", vec!["NAME".into(), "DOB".into()]);
        assert_eq!(key.to_string(), "MATCH_KEY:NAME:DOB");
    }
}
