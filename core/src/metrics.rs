use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::CoreErr;
use crate::error::Result;

/// Cost accumulator for one task.
///
/// Cloning shares the underlying counter: a delegate controller holds a clone
/// of its parent's handle, so everything the delegate spends counts toward
/// the parent's budget. Serialization snapshots the value; deserialization
/// produces a fresh, unshared handle.
#[derive(Clone, Default)]
pub struct Metrics {
    accumulated_cost: Arc<Mutex<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn cost(&self) -> std::sync::MutexGuard<'_, f64> {
        match self.accumulated_cost.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn accumulated_cost(&self) -> f64 {
        *self.cost()
    }

    pub fn add_cost(&self, value: f64) -> Result<()> {
        if value < 0.0 {
            return Err(CoreErr::Internal(format!(
                "added cost must be non-negative, got {value}"
            )));
        }
        *self.cost() += value;
        Ok(())
    }

    pub fn reset(&self) {
        *self.cost() = 0.0;
    }

    /// Whether two handles share one counter.
    pub fn shares_with(&self, other: &Metrics) -> bool {
        Arc::ptr_eq(&self.accumulated_cost, &other.accumulated_cost)
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("accumulated_cost", &self.accumulated_cost())
            .finish()
    }
}

impl PartialEq for Metrics {
    fn eq(&self, other: &Self) -> bool {
        self.accumulated_cost() == other.accumulated_cost()
    }
}

#[derive(Serialize, Deserialize)]
struct MetricsSnapshot {
    accumulated_cost: f64,
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        MetricsSnapshot {
            accumulated_cost: self.accumulated_cost(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Metrics {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let snapshot = MetricsSnapshot::deserialize(deserializer)?;
        Ok(Metrics {
            accumulated_cost: Arc::new(Mutex::new(snapshot.accumulated_cost)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates() {
        let metrics = Metrics::new();
        metrics.add_cost(1.5).unwrap();
        metrics.add_cost(0.5).unwrap();
        assert_eq!(metrics.accumulated_cost(), 2.0);
        metrics.reset();
        assert_eq!(metrics.accumulated_cost(), 0.0);
    }

    #[test]
    fn rejects_negative_cost() {
        let metrics = Metrics::new();
        assert!(metrics.add_cost(-0.1).is_err());
        assert_eq!(metrics.accumulated_cost(), 0.0);
    }

    #[test]
    fn clones_share_the_counter() {
        let parent = Metrics::new();
        let child = parent.clone();
        child.add_cost(3.0).unwrap();
        assert_eq!(parent.accumulated_cost(), 3.0);
        assert!(parent.shares_with(&child));
    }

    #[test]
    fn serialization_snapshots_and_unshares() {
        let metrics = Metrics::new();
        metrics.add_cost(2.25).unwrap();
        let json = serde_json::to_string(&metrics).unwrap();
        let restored: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.accumulated_cost(), 2.25);
        assert!(!restored.shares_with(&metrics));
    }
}
