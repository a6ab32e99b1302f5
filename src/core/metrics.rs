//! Scalar metric tracking: a sliding recent window per meter plus an
//! unbounded running sum/count, and value-semantics snapshots whose merge is
//! associative and commutative. Worker processes (or rayon shards) each keep
//! a local tracker and reduce snapshots at the end of an epoch; the result
//! is identical regardless of worker count or merge order.

use std::collections::VecDeque;
use std::fmt;

use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One tracked scalar: recent window for display, global sum/count for the
/// epoch average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.max(1)),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value;
        self.count += 1;
    }

    /// Most recent value, or 0.0 before any update.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    /// Mean over the recent window.
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Mean over every value ever recorded.
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            sum: self.total,
            count: self.count,
        }
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.avg(), self.global_avg())
    }
}

/// Value-type summary of one meter. Merging sums the parts, so any merge
/// tree over any worker order produces the same global average.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeterSnapshot {
    pub sum: f64,
    pub count: u64,
}

impl MeterSnapshot {
    pub fn merge(self, other: MeterSnapshot) -> MeterSnapshot {
        MeterSnapshot {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Named meters with stable insertion order for reporting.
#[derive(Debug, Clone)]
pub struct MetricTracker {
    meters: HashMap<String, SmoothedValue>,
    order: Vec<String>,
    default_window: usize,
}

impl MetricTracker {
    pub fn new() -> Self {
        Self {
            meters: HashMap::new(),
            order: Vec::new(),
            default_window: 20,
        }
    }

    /// Pre-register a meter with an explicit window size.
    pub fn with_meter(mut self, name: &str, window_size: usize) -> Self {
        self.ensure(name, window_size);
        self
    }

    fn ensure(&mut self, name: &str, window_size: usize) {
        if !self.meters.contains_key(name) {
            self.meters
                .insert(name.to_string(), SmoothedValue::new(window_size));
            self.order.push(name.to_string());
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        let window = self.default_window;
        self.ensure(name, window);
        if let Some(meter) = self.meters.get_mut(name) {
            meter.update(value);
        }
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn global_averages(&self) -> Vec<(String, f64)> {
        self.order
            .iter()
            .filter_map(|name| {
                self.meters
                    .get(name)
                    .map(|m| (name.clone(), m.global_avg()))
            })
            .collect()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            meters: self
                .order
                .iter()
                .filter_map(|name| self.meters.get(name).map(|m| (name.clone(), m.snapshot())))
                .collect(),
        }
    }
}

impl Default for MetricTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MetricTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in &self.order {
            if let Some(meter) = self.meters.get(name) {
                if !first {
                    write!(f, "  ")?;
                }
                write!(f, "{name}: {meter}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Snapshot of a whole tracker; the cross-worker reduction unit.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackerSnapshot {
    meters: Vec<(String, MeterSnapshot)>,
}

impl TrackerSnapshot {
    /// Merge another worker's snapshot into this one. Meters missing on
    /// either side are carried through unchanged; matching meters sum.
    pub fn merge(mut self, other: &TrackerSnapshot) -> TrackerSnapshot {
        for (name, snap) in &other.meters {
            if let Some((_, mine)) = self.meters.iter_mut().find(|(n, _)| n == name) {
                *mine = mine.merge(*snap);
            } else {
                self.meters.push((name.clone(), *snap));
            }
        }
        self
    }

    pub fn global_avg(&self, name: &str) -> Option<f64> {
        self.meters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.global_avg())
    }

    pub fn meters(&self) -> &[(String, MeterSnapshot)] {
        &self.meters
    }

    /// JSON object of per-meter global averages, for report lines.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, snap) in &self.meters {
            if let Some(v) = serde_json::Number::from_f64(snap.global_avg()) {
                map.insert(name.clone(), serde_json::Value::Number(v));
            }
        }
        serde_json::Value::Object(map)
    }
}
