//! Aggregate statistics over the record store

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{FixityState, Timestamp};
use crate::store::{RecordFilter, RecordStore};

/// Periodic-check coverage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicStats {
    /// Records with periodic checks enabled
    pub total: u64,
    /// Periodic records checked at or after the threshold
    pub current: u64,
    /// Periodic records due for a re-check
    pub expired: u64,
}

/// Snapshot of the record store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixityStats {
    /// Periodic coverage
    pub periodic: PeriodicStats,
    /// Revisions ever recorded
    pub revisions: u64,
    /// Performed records by current state
    pub states: BTreeMap<FixityState, u64>,
    /// Performed records whose current state did not pass
    pub failed: u64,
}

impl FixityStats {
    /// Read the statistics from `store` against `threshold`
    pub fn collect(store: &dyn RecordStore, threshold: Timestamp) -> Result<Self> {
        let states = store.count_by_state(&RecordFilter::all().performed(true))?;
        let failed = states
            .iter()
            .filter(|(state, _)| !state.passed())
            .map(|(_, count)| count)
            .sum();

        let total = store.count(&RecordFilter::all().periodic(true))?;
        let current = store.count(&RecordFilter::all().periodic(true).current_at(threshold))?;

        Ok(Self {
            periodic: PeriodicStats {
                total,
                current,
                expired: total.saturating_sub(current),
            },
            revisions: store.count_revisions()?,
            states,
            failed,
        })
    }

    /// Human-readable summary lines
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            plural(
                self.revisions,
                "check has been performed since tracking started.",
                "checks have been performed since tracking started.",
            ),
            plural(
                self.periodic.total,
                "file is set to be checked periodically.",
                "files are set to be checked periodically.",
            ),
            plural(
                self.periodic.current,
                "periodic check is up to date.",
                "periodic checks are up to date.",
            ),
        ];
        if self.periodic.expired > 0 {
            lines.push(plural(
                self.periodic.expired,
                "periodic check is out of date.",
                "periodic checks are out of date.",
            ));
        }
        if self.failed > 0 {
            lines.push(plural(
                self.failed,
                "check has failed.",
                "checks have failed.",
            ));
            for (state, count) in &self.states {
                lines.push(format!("{}.", state.describe_count(*count)));
            }
        }
        lines
    }
}

fn plural(count: u64, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{count} {singular}")
    } else {
        format!("{count} {plural}")
    }
}
