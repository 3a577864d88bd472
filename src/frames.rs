//! Frame filenames.
//!
//! Raw frames are named
//! `<inst>_<type>_<yyyymmdd>_<multrun>_<run>_<window>_0.fits`. The night
//! rolls over at local noon, so a frame taken at 03:00 belongs to the previous
//! date. The multrun number restarts at 1 every night and is persisted so a
//! restart mid-night does not overwrite earlier frames.

use crate::arm::Arm;
use crate::error::PersistError;
use crate::persist::{load_properties, property_i64, save_properties};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const NIGHT_KEY: &str = "night";
const MULTRUN_KEY: &str = "multrun";
const FULL_FRAME_WINDOW: u32 = 1;

/// Exposure type letter in a frame name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureCode {
    /// Science exposure.
    Exposure,
    /// Bias.
    Bias,
    /// Dark.
    Dark,
    /// Arc lamp.
    Arc,
    /// Lamp flat.
    LampFlat,
    /// Focus scan frame.
    Focus,
}

impl ExposureCode {
    /// Letter used in the filename.
    pub fn letter(self) -> char {
        match self {
            ExposureCode::Exposure => 'e',
            ExposureCode::Bias => 'b',
            ExposureCode::Dark => 'd',
            ExposureCode::Arc => 'a',
            ExposureCode::LampFlat => 'w',
            ExposureCode::Focus => 'f',
        }
    }
}

#[derive(Debug)]
struct Sequence {
    night: NaiveDate,
    multrun: i64,
    run: i64,
    code: ExposureCode,
}

/// Hands out frame filenames for one arm.
#[derive(Debug)]
pub struct FrameNamer {
    arm: Arm,
    dir: PathBuf,
    state_path: PathBuf,
    sequence: Mutex<Sequence>,
}

fn night_of(now: DateTime<Utc>) -> NaiveDate {
    (now - ChronoDuration::hours(12)).date_naive()
}

impl FrameNamer {
    /// Restore numbering for `arm` from `state_path`; frames go into `dir`.
    pub fn load(arm: Arm, dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let state_path = state_path.into();
        let properties = load_properties(&state_path)?;
        let night = match properties.get(NIGHT_KEY) {
            Some(text) => NaiveDate::parse_from_str(text, "%Y%m%d").map_err(|_| PersistError::Malformed {
                path: state_path.clone(),
                value: text.clone(),
            })?,
            None => NaiveDate::MIN,
        };
        let multrun = property_i64(&state_path, &properties, MULTRUN_KEY)?.unwrap_or(0);
        Ok(Self {
            arm,
            dir: dir.into(),
            state_path,
            sequence: Mutex::new(Sequence {
                night,
                multrun,
                run: 0,
                code: ExposureCode::Exposure,
            }),
        })
    }

    /// Start a new multrun of frames of type `code`. Returns the new multrun
    /// number; numbering is left untouched if it cannot be persisted.
    pub fn begin_multrun(&self, code: ExposureCode, now: DateTime<Utc>) -> Result<i64, PersistError> {
        let mut sequence = self.sequence.lock();
        let night = night_of(now);
        let multrun = if night == sequence.night { sequence.multrun + 1 } else { 1 };

        let mut properties = BTreeMap::new();
        properties.insert(NIGHT_KEY.to_string(), night.format("%Y%m%d").to_string());
        properties.insert(MULTRUN_KEY.to_string(), multrun.to_string());
        save_properties(&self.state_path, &properties)?;

        *sequence = Sequence {
            night,
            multrun,
            run: 0,
            code,
        };
        Ok(multrun)
    }

    /// Filename of the next frame in the current multrun.
    pub fn next_frame(&self) -> PathBuf {
        let mut sequence = self.sequence.lock();
        sequence.run += 1;
        self.dir.join(format!(
            "{}_{}_{}_{}_{}_{}_0.fits",
            self.arm.instrument_code(),
            sequence.code.letter(),
            sequence.night.format("%Y%m%d"),
            sequence.multrun,
            sequence.run,
            FULL_FRAME_WINDOW,
        ))
    }

    /// Current multrun number.
    pub fn multrun(&self) -> i64 {
        self.sequence.lock().multrun
    }
}
