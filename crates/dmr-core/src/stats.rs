use std::collections::BTreeMap;

/// A single named statistic, paired with its unit (`ms` or `tasks`).
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize)]
pub struct StatValue {
    pub value: f64,
    pub unit: &'static str,
}

impl StatValue {
    pub fn ms(value: f64) -> Self {
        Self { value, unit: "ms" }
    }

    pub fn count(value: f64) -> Self {
        Self {
            value,
            unit: "tasks",
        }
    }
}

/// A `Statistic -> Number` map, as exposed by the scheduler, task group, and
/// other components.
pub type Statistics = BTreeMap<String, StatValue>;
