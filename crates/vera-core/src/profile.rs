//! Time profiles and the global time axis.
//!
//! Every scalar device attribute that varies with time has a companion
//! profile of the same length as the grid time axis. Two storage layouts are
//! provided behind the [`Profile`] trait: a dense vector, and a sparse patch
//! map over a default value for profiles that rarely change (breaker states,
//! seasonal ratings).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{VgError, VgResult};

/// Accessor surface shared by the dense and sparse layouts.
pub trait Profile<T: Copy> {
    /// Number of time steps covered.
    fn len(&self) -> usize;

    /// Value at time index `t`.
    fn get(&self, t: usize) -> T;

    /// Overwrite the value at time index `t`.
    fn set(&mut self, t: usize, value: T);

    /// Whether the backing storage is a dense vector.
    fn is_dense(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense profile: one stored value per time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseProfile<T> {
    pub values: Vec<T>,
}

impl<T: Copy> DenseProfile<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self { values }
    }

    /// Constant profile of the given length.
    pub fn constant(value: T, len: usize) -> Self {
        Self {
            values: vec![value; len],
        }
    }
}

impl<T: Copy> Profile<T> for DenseProfile<T> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn get(&self, t: usize) -> T {
        self.values[t]
    }

    fn set(&mut self, t: usize, value: T) {
        self.values[t] = value;
    }

    fn is_dense(&self) -> bool {
        true
    }
}

/// Sparse profile: a default value plus patches at the indices that differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsePatchProfile<T> {
    pub default: T,
    pub patches: BTreeMap<usize, T>,
    len: usize,
}

impl<T: Copy + PartialEq> SparsePatchProfile<T> {
    pub fn new(default: T, len: usize) -> Self {
        Self {
            default,
            patches: BTreeMap::new(),
            len,
        }
    }

    /// Number of explicit patches held.
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }
}

impl<T: Copy + PartialEq> Profile<T> for SparsePatchProfile<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, t: usize) -> T {
        self.patches.get(&t).copied().unwrap_or(self.default)
    }

    fn set(&mut self, t: usize, value: T) {
        if value == self.default {
            self.patches.remove(&t);
        } else {
            self.patches.insert(t, value);
        }
    }

    fn is_dense(&self) -> bool {
        false
    }
}

/// Concrete profile storage carried by device fields. Enum dispatch keeps
/// devices `Clone` and serde-friendly without trait objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumProfile {
    Dense(DenseProfile<f64>),
    Sparse(SparsePatchProfile<f64>),
}

impl Profile<f64> for NumProfile {
    fn len(&self) -> usize {
        match self {
            NumProfile::Dense(p) => p.len(),
            NumProfile::Sparse(p) => p.len(),
        }
    }

    fn get(&self, t: usize) -> f64 {
        match self {
            NumProfile::Dense(p) => p.get(t),
            NumProfile::Sparse(p) => p.get(t),
        }
    }

    fn set(&mut self, t: usize, value: f64) {
        match self {
            NumProfile::Dense(p) => p.set(t, value),
            NumProfile::Sparse(p) => p.set(t, value),
        }
    }

    fn is_dense(&self) -> bool {
        matches!(self, NumProfile::Dense(_))
    }
}

/// Boolean profile used for device active status over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoolProfile {
    Dense(DenseProfile<bool>),
    Sparse(SparsePatchProfile<bool>),
}

impl Profile<bool> for BoolProfile {
    fn len(&self) -> usize {
        match self {
            BoolProfile::Dense(p) => p.len(),
            BoolProfile::Sparse(p) => p.len(),
        }
    }

    fn get(&self, t: usize) -> bool {
        match self {
            BoolProfile::Dense(p) => p.get(t),
            BoolProfile::Sparse(p) => p.get(t),
        }
    }

    fn set(&mut self, t: usize, value: bool) {
        match self {
            BoolProfile::Dense(p) => p.set(t, value),
            BoolProfile::Sparse(p) => p.set(t, value),
        }
    }

    fn is_dense(&self) -> bool {
        matches!(self, BoolProfile::Dense(_))
    }
}

/// Ordered timestamp array shared by all profiles of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAxis {
    stamps: Vec<DateTime<Utc>>,
}

impl TimeAxis {
    /// Construct from timestamps, rejecting non-strictly-monotonic input.
    pub fn new(stamps: Vec<DateTime<Utc>>) -> VgResult<Self> {
        for w in stamps.windows(2) {
            if w[1] <= w[0] {
                return Err(VgError::MalformedGrid(format!(
                    "time axis is not strictly monotonic at {} -> {}",
                    w[0], w[1]
                )));
            }
        }
        Ok(Self { stamps })
    }

    /// Hourly axis of `len` steps starting at `start`.
    pub fn hourly(start: DateTime<Utc>, len: usize) -> Self {
        let stamps = (0..len)
            .map(|i| start + chrono::Duration::hours(i as i64))
            .collect();
        Self { stamps }
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn stamps(&self) -> &[DateTime<Utc>] {
        &self.stamps
    }

    /// Step durations in hours (last step repeats the previous duration, or
    /// 1 h for a single-step axis).
    pub fn step_hours(&self) -> Vec<f64> {
        let n = self.stamps.len();
        let mut dt = vec![1.0; n];
        for i in 0..n.saturating_sub(1) {
            let secs = (self.stamps[i + 1] - self.stamps[i]).num_seconds() as f64;
            dt[i] = secs / 3600.0;
        }
        if n > 1 {
            dt[n - 1] = dt[n - 2];
        }
        dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dense_profile_roundtrip() {
        let mut p = DenseProfile::constant(1.0, 4);
        p.set(2, 5.0);
        assert_eq!(p.get(2), 5.0);
        assert_eq!(p.get(0), 1.0);
        assert!(p.is_dense());
    }

    #[test]
    fn test_sparse_profile_patches() {
        let mut p = SparsePatchProfile::new(true, 100);
        p.set(10, false);
        p.set(11, false);
        assert_eq!(p.patch_count(), 2);
        assert!(!p.get(10));
        assert!(p.get(50));
        // Writing the default back removes the patch
        p.set(10, true);
        assert_eq!(p.patch_count(), 1);
        assert!(!p.is_dense());
    }

    #[test]
    fn test_time_axis_monotonic() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let axis = TimeAxis::hourly(t0, 24);
        assert_eq!(axis.len(), 24);
        assert!(axis.step_hours().iter().all(|&h| (h - 1.0).abs() < 1e-12));

        let bad = TimeAxis::new(vec![t0, t0]);
        assert!(bad.is_err());
    }
}
