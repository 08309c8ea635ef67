//! Deterministic fault injection.
//!
//! Named `(component, operation)` points are compiled into the execution
//! blocks. A point is a strict no-op until armed; once armed, the next call
//! through it fails with [`AqlError::FaultInjected`]. Points can be armed
//! programmatically, from the `[execution] faults` config list, or through the
//! `AQUEDUCT_FAULTS` environment variable (`Component::operation,...`).

use std::fmt;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::types::{AqlError, Result};

/// Environment variable listing points armed at registry construction.
pub const FAULTS_ENV: &str = "AQUEDUCT_FAULTS";

/// A named fault point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FaultPoint {
    /// Component, e.g. `SortBlock`.
    pub component: &'static str,
    /// Operation within the component, e.g. `doSorting`.
    pub operation: &'static str,
}

impl FaultPoint {
    const fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
        }
    }

    /// Resolves a `Component::operation` name to a known point.
    pub fn parse(name: &str) -> Option<FaultPoint> {
        points::all()
            .iter()
            .copied()
            .find(|point| point.to_string() == name.trim())
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.component, self.operation)
    }
}

/// All defined fault points.
pub mod points {
    use super::FaultPoint;

    /// Any block call made by the driver.
    pub const BLOCK_GET_OR_SKIP: FaultPoint = FaultPoint::new("ExecutionBlock", "getOrSkipSome");
    /// Sorting buffered rows.
    pub const SORT_DO_SORTING: FaultPoint = FaultPoint::new("SortBlock", "doSorting");
    /// Opening an index iterator.
    pub const INDEX_OPEN_ITERATOR: FaultPoint = FaultPoint::new("IndexScanBlock", "openIterator");
    /// Starting a full collection scan.
    pub const ENUMERATE_SCAN: FaultPoint = FaultPoint::new("EnumerateCollectionBlock", "scan");
    /// Evaluating a calculation batch.
    pub const CALCULATION_EVALUATE: FaultPoint = FaultPoint::new("CalculationBlock", "evaluate");
    /// Applying one write.
    pub const MODIFICATION_APPLY: FaultPoint = FaultPoint::new("ModificationBlock", "apply");
    /// Dispatching the shard fragment.
    pub const GATHER_DISPATCH: FaultPoint = FaultPoint::new("GatherBlock", "dispatch");
    /// Fetching documents after late materialization.
    pub const MATERIALIZE_FETCH: FaultPoint = FaultPoint::new("MaterializeBlock", "fetch");

    /// Every defined point.
    pub fn all() -> &'static [FaultPoint] {
        &[
            BLOCK_GET_OR_SKIP,
            SORT_DO_SORTING,
            INDEX_OPEN_ITERATOR,
            ENUMERATE_SCAN,
            CALCULATION_EVALUATE,
            MODIFICATION_APPLY,
            GATHER_DISPATCH,
            MATERIALIZE_FETCH,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Arming {
    /// Fires on every call until disarmed.
    Always,
    /// Fires once, then disarms itself.
    Once,
}

/// Set of armed fault points, shared by every block of a query.
#[derive(Debug, Default)]
pub struct FaultRegistry {
    armed: Mutex<FxHashMap<FaultPoint, Arming>>,
}

impl FaultRegistry {
    /// Registry with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry armed from `AQUEDUCT_FAULTS` plus the given names.
    pub fn from_env_and(names: &[String]) -> Self {
        let registry = Self::new();
        let from_env = std::env::var(FAULTS_ENV).unwrap_or_default();
        for name in from_env
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(str::to_owned)
            .chain(names.iter().cloned())
        {
            match FaultPoint::parse(&name) {
                Some(point) => registry.arm(point),
                None => warn!(fault = %name, "ignoring unknown fault point"),
            }
        }
        registry
    }

    /// Arms `point` until it is disarmed.
    pub fn arm(&self, point: FaultPoint) {
        self.armed.lock().insert(point, Arming::Always);
    }

    /// Arms `point` for a single firing.
    pub fn arm_once(&self, point: FaultPoint) {
        self.armed.lock().insert(point, Arming::Once);
    }

    /// Disarms `point`.
    pub fn disarm(&self, point: FaultPoint) {
        self.armed.lock().remove(&point);
    }

    /// Disarms every point.
    pub fn clear(&self) {
        self.armed.lock().clear();
    }

    /// True if `point` is armed.
    pub fn is_armed(&self, point: FaultPoint) -> bool {
        self.armed.lock().contains_key(&point)
    }

    /// Fails if `point` is armed.
    pub fn check(&self, point: FaultPoint) -> Result<()> {
        let mut armed = self.armed.lock();
        let Some(arming) = armed.get(&point).copied() else {
            return Ok(());
        };
        if arming == Arming::Once {
            armed.remove(&point);
        }
        drop(armed);
        warn!(point = %point, "fault injection point fired");
        Err(AqlError::FaultInjected(point.to_string()))
    }
}
