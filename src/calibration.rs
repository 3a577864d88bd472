//! DAY_CALIBRATE planning.
//!
//! The catalog is an ordered list of candidate calibrations. Each
//! invocation rebuilds it from configuration, merges the persisted last-run
//! times for the arm, and walks it once in order: an entry runs only if the
//! command deadline has not passed, it is due, and it fits in what is left of
//! the budget. Skipped entries are not revisited.
//!
//! Last-run times are stored per arm in a property file under keys of the form
//! `<prefix>.<arm>.<type>.<binning>.<exposureMs>.<count>`, valued in epoch
//! milliseconds.

use crate::arm::Arm;
use crate::config::CatalogSpec;
use crate::error::PersistError;
use crate::persist::{load_properties, property_i64, save_properties};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kind of daytime calibration frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CalibrationType {
    /// Zero-length readout.
    Bias,
    /// Shutter-closed exposure.
    Dark,
}

impl fmt::Display for CalibrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationType::Bias => write!(f, "BIAS"),
            CalibrationType::Dark => write!(f, "DARK"),
        }
    }
}

/// One catalog entry with its last-run time merged in.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    /// BIAS or DARK.
    pub kind: CalibrationType,
    /// Binning (both axes).
    pub binning: u32,
    /// Minimum interval between runs.
    pub frequency: Duration,
    /// Frames per run.
    pub count: u32,
    /// Exposure length; zero for BIAS.
    pub exposure: Duration,
    /// Last successful run; `None` if never.
    pub last_run_at: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    /// Entry for `spec`, never run.
    pub fn from_spec(spec: &CatalogSpec) -> Self {
        Self {
            kind: spec.kind,
            binning: spec.binning,
            frequency: spec.frequency,
            count: spec.count,
            exposure: match spec.kind {
                CalibrationType::Bias => Duration::ZERO,
                CalibrationType::Dark => spec.exposure,
            },
            last_run_at: None,
        }
    }

    /// `count * (exposure + readout)`.
    pub fn estimated_duration(&self, readout: Duration) -> Duration {
        (self.exposure + readout) * self.count
    }

    /// Key of this entry in the last-run store.
    pub fn store_key(&self, prefix: &str, arm: Arm) -> String {
        format!(
            "{prefix}.{}.{}.{}.{}.{}",
            arm.key(),
            self.kind,
            self.binning,
            self.exposure.as_millis(),
            self.count
        )
    }
}

/// Why an entry was not run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// `now` is past the deadline.
    DeadlinePassed,
    /// Ran less than `frequency` ago.
    TooRecent,
    /// Would finish after the deadline.
    WouldOverrun,
}

/// Outcome of planning one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Execute; expected to take `estimated`.
    Run {
        /// Estimated duration.
        estimated: Duration,
    },
    /// Leave for another day.
    Skip(SkipReason),
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Decide whether `entry` runs now.
pub fn plan_entry(entry: &CatalogEntry, now: DateTime<Utc>, deadline: DateTime<Utc>, readout: Duration) -> Decision {
    if now > deadline {
        return Decision::Skip(SkipReason::DeadlinePassed);
    }
    if let Some(last) = entry.last_run_at {
        if now - last < delta(entry.frequency) {
            return Decision::Skip(SkipReason::TooRecent);
        }
    }
    let estimated = entry.estimated_duration(readout);
    match now.checked_add_signed(delta(estimated)) {
        Some(finish) if finish <= deadline => Decision::Run { estimated },
        _ => Decision::Skip(SkipReason::WouldOverrun),
    }
}

/// Build a fresh catalog from configuration.
pub fn load_catalog(specs: &[CatalogSpec]) -> Vec<CatalogEntry> {
    specs.iter().map(CatalogEntry::from_spec).collect()
}

/// Persisted last-run times.
#[derive(Clone, Debug)]
pub struct LastRunStore {
    path: PathBuf,
    prefix: String,
    properties: BTreeMap<String, String>,
}

impl LastRunStore {
    /// Read the store at `path`; a missing file is empty.
    pub fn load(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, PersistError> {
        let path = path.into();
        let properties = load_properties(&path)?;
        Ok(Self {
            path,
            prefix: prefix.into(),
            properties,
        })
    }

    /// Last run of `entry` on `arm`.
    pub fn last_run(&self, entry: &CatalogEntry, arm: Arm) -> Result<Option<DateTime<Utc>>, PersistError> {
        let key = entry.store_key(&self.prefix, arm);
        let Some(millis) = property_i64(&self.path, &self.properties, &key)? else {
            return Ok(None);
        };
        if millis == 0 {
            return Ok(None);
        }
        DateTime::from_timestamp_millis(millis)
            .map(Some)
            .ok_or_else(|| PersistError::Malformed {
                path: self.path.clone(),
                value: millis.to_string(),
            })
    }

    /// Set the last run of `entry` on `arm` (in memory).
    pub fn set_last_run(&mut self, entry: &CatalogEntry, arm: Arm, at: DateTime<Utc>) {
        let key = entry.store_key(&self.prefix, arm);
        self.properties.insert(key, at.timestamp_millis().to_string());
    }

    /// Write the store back to disk.
    pub fn save(&self) -> Result<(), PersistError> {
        save_properties(&self.path, &self.properties)
    }
}

/// Fill in `last_run_at` for every entry from `store`.
pub fn add_saved_state(catalog: &mut [CatalogEntry], store: &LastRunStore, arm: Arm) -> Result<(), PersistError> {
    for entry in catalog.iter_mut() {
        entry.last_run_at = store.last_run(entry, arm)?;
    }
    Ok(())
}

/// Record a completed run of `entry`: reload the store, update it, save it.
/// If any step fails `entry.last_run_at` is left at its previous value.
pub fn record_run(
    path: &Path,
    prefix: &str,
    arm: Arm,
    entry: &mut CatalogEntry,
    at: DateTime<Utc>,
) -> Result<(), PersistError> {
    let mut store = LastRunStore::load(path, prefix)?;
    store.set_last_run(entry, arm, at);
    store.save()?;
    entry.last_run_at = Some(at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap()
    }

    fn bias(frequency: Duration, count: u32) -> CatalogEntry {
        CatalogEntry {
            kind: CalibrationType::Bias,
            binning: 1,
            frequency,
            count,
            exposure: Duration::ZERO,
            last_run_at: None,
        }
    }

    #[test]
    fn test_recent_entry_is_skipped() {
        let mut entry = bias(Duration::from_secs(3600), 3);
        entry.last_run_at = Some(now() - TimeDelta::minutes(30));
        let deadline = now() + TimeDelta::hours(2);
        assert_eq!(
            plan_entry(&entry, now(), deadline, Duration::from_secs(5)),
            Decision::Skip(SkipReason::TooRecent)
        );
    }

    #[test]
    fn test_exactly_due_entry_runs() {
        let mut entry = bias(Duration::from_secs(3600), 3);
        entry.last_run_at = Some(now() - TimeDelta::hours(1));
        let deadline = now() + TimeDelta::seconds(15);
        assert_eq!(
            plan_entry(&entry, now(), deadline, Duration::from_secs(5)),
            Decision::Run {
                estimated: Duration::from_secs(15)
            }
        );
    }

    #[test]
    fn test_dark_that_would_overrun_is_skipped() {
        let entry = CatalogEntry {
            kind: CalibrationType::Dark,
            binning: 1,
            frequency: Duration::from_secs(3600),
            count: 2,
            exposure: Duration::from_millis(60_000),
            last_run_at: None,
        };
        assert_eq!(entry.estimated_duration(Duration::from_millis(5_000)), Duration::from_millis(130_000));
        let deadline = now() + TimeDelta::milliseconds(100_000);
        assert_eq!(
            plan_entry(&entry, now(), deadline, Duration::from_millis(5_000)),
            Decision::Skip(SkipReason::WouldOverrun)
        );
    }

    #[test]
    fn test_past_deadline_skips_everything() {
        let entry = bias(Duration::from_secs(1), 1);
        let deadline = now() - TimeDelta::seconds(1);
        assert_eq!(
            plan_entry(&entry, now(), deadline, Duration::ZERO),
            Decision::Skip(SkipReason::DeadlinePassed)
        );
    }

    #[test]
    fn test_store_key_format() {
        let entry = CatalogEntry {
            kind: CalibrationType::Dark,
            binning: 2,
            frequency: Duration::from_secs(1),
            count: 4,
            exposure: Duration::from_secs(60),
            last_run_at: None,
        };
        assert_eq!(entry.store_key("dc", Arm::Blue), "dc.blue.DARK.2.60000.4");
    }

    #[test]
    fn test_saved_state_reload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.properties");
        let mut catalog = vec![bias(Duration::from_secs(3600), 3), bias(Duration::from_secs(60), 5)];

        record_run(&path, "dc", Arm::Red, &mut catalog[0], now()).unwrap();
        let before: Vec<_> = catalog.iter().map(|e| e.last_run_at).collect();

        let store = LastRunStore::load(&path, "dc").unwrap();
        add_saved_state(&mut catalog, &store, Arm::Red).unwrap();
        let first: Vec<_> = catalog.iter().map(|e| e.last_run_at).collect();
        let store = LastRunStore::load(&path, "dc").unwrap();
        add_saved_state(&mut catalog, &store, Arm::Red).unwrap();
        let second: Vec<_> = catalog.iter().map(|e| e.last_run_at).collect();

        assert_eq!(before, first);
        assert_eq!(first, second);
        assert_eq!(first[0], Some(now()));
        assert_eq!(first[1], None);

        // Other arm's entries are independent.
        add_saved_state(&mut catalog, &store, Arm::Blue).unwrap();
        assert_eq!(catalog[0].last_run_at, None);
    }

    #[test]
    fn test_failed_save_leaves_entry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.properties");
        std::fs::create_dir(dir.path().join("day.properties.tmp")).unwrap();
        let mut entry = bias(Duration::from_secs(60), 1);
        let previous = Some(now() - TimeDelta::days(1));
        entry.last_run_at = previous;

        assert!(record_run(&path, "dc", Arm::Red, &mut entry, now()).is_err());
        assert_eq!(entry.last_run_at, previous);
    }
}
