//! Arm identity and per-arm storage.
//!
//! The spectrograph has two optical channels. Most shared status is kept in
//! triples indexed `[NONE, RED, BLUE]` so that an [`Arm`] converts directly
//! into an array index; the `NONE` slot exists only so that commands which do
//! not target an arm still have somewhere to resolve to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

/// One of the spectrograph's optical channels, or `None` for commands that
/// do not address an arm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Arm {
    /// No arm; used by status and interrupt commands.
    #[default]
    None,
    /// Red arm.
    Red,
    /// Blue arm.
    Blue,
}

impl Arm {
    /// The two arms that own hardware.
    pub const PHYSICAL: [Arm; 2] = [Arm::Red, Arm::Blue];

    /// Array index of this arm in a [`PerArm`] triple.
    pub fn index(self) -> usize {
        match self {
            Arm::None => 0,
            Arm::Red => 1,
            Arm::Blue => 2,
        }
    }

    /// Whether this arm owns hardware (RED or BLUE).
    pub fn is_physical(self) -> bool {
        !matches!(self, Arm::None)
    }

    /// Lowercase name used in persisted keys and frame prefixes.
    pub fn key(self) -> &'static str {
        match self {
            Arm::None => "none",
            Arm::Red => "red",
            Arm::Blue => "blue",
        }
    }

    /// Single-character instrument code used in frame filenames.
    pub fn instrument_code(self) -> char {
        match self {
            Arm::None => 'n',
            Arm::Red => 'r',
            Arm::Blue => 'b',
        }
    }
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arm::None => write!(f, "NONE"),
            Arm::Red => write!(f, "RED"),
            Arm::Blue => write!(f, "BLUE"),
        }
    }
}

impl FromStr for Arm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Arm::None),
            "red" => Ok(Arm::Red),
            "blue" => Ok(Arm::Blue),
            other => Err(format!("unknown arm '{other}'")),
        }
    }
}

/// A `[NONE, RED, BLUE]` triple. The `NONE` slot is never written by
/// arm-targeting code.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerArm<T>([T; 3]);

impl<T> PerArm<T> {
    /// Build a triple by evaluating `f` for each arm in index order.
    pub fn from_fn(mut f: impl FnMut(Arm) -> T) -> Self {
        Self([f(Arm::None), f(Arm::Red), f(Arm::Blue)])
    }

    /// Iterate over the RED and BLUE entries.
    pub fn physical(&self) -> impl Iterator<Item = (Arm, &T)> {
        Arm::PHYSICAL.into_iter().map(move |arm| (arm, &self[arm]))
    }
}

impl<T> Index<Arm> for PerArm<T> {
    type Output = T;

    fn index(&self, arm: Arm) -> &T {
        &self.0[arm.index()]
    }
}

impl<T> IndexMut<Arm> for PerArm<T> {
    fn index_mut(&mut self, arm: Arm) -> &mut T {
        &mut self.0[arm.index()]
    }
}

/// A value held only for the two physical arms, e.g. per-arm devices or
/// per-arm configuration sections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmPair<T> {
    /// Red arm value.
    pub red: T,
    /// Blue arm value.
    pub blue: T,
}

impl<T> ArmPair<T> {
    /// Create a pair from explicit red/blue values.
    pub fn new(red: T, blue: T) -> Self {
        Self { red, blue }
    }

    /// Value for `arm`, or `None` when `arm` is [`Arm::None`].
    pub fn get(&self, arm: Arm) -> Option<&T> {
        match arm {
            Arm::Red => Some(&self.red),
            Arm::Blue => Some(&self.blue),
            Arm::None => None,
        }
    }

    /// Map both values.
    pub fn map<U>(self, mut f: impl FnMut(Arm, T) -> U) -> ArmPair<U> {
        ArmPair {
            red: f(Arm::Red, self.red),
            blue: f(Arm::Blue, self.blue),
        }
    }

    /// Map both values by reference, propagating the first error.
    pub fn try_map_ref<U, E>(&self, mut f: impl FnMut(Arm, &T) -> Result<U, E>) -> Result<ArmPair<U>, E> {
        Ok(ArmPair {
            red: f(Arm::Red, &self.red)?,
            blue: f(Arm::Blue, &self.blue)?,
        })
    }
}
