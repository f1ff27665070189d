//! Filter configuration: the eight adjustable filters and their presets.
//!
//! [`FilterState`] is total over [`FilterKind::ALL`]: every filter always has
//! a value, and `0` is the no-op for every one of them. That makes the state
//! safe to hash and compare without worrying about missing keys.
//!
//! ## Ranges
//!
//! | Filter | Range | Meaning |
//! |---|---|---|
//! | brightness | -100..100 | added to each channel |
//! | contrast | -100..100 | classic 259/255 contrast curve |
//! | saturation | -100..100 | factor `(s + 100) / 100` around luma |
//! | hue | 0..360 | hue rotation in degrees |
//! | sepia | 0..100 | blend toward the sepia matrix |
//! | grayscale | 0..100 | blend toward luma |
//! | invert | 0..100 | blend toward the negative |
//! | blur | 0..20 | gaussian sigma in pixels |

use super::params::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Brightness,
    Contrast,
    Saturation,
    Blur,
    Sepia,
    Hue,
    Grayscale,
    Invert,
}

impl FilterKind {
    /// Every filter, in the order they are applied to pixels.
    ///
    /// Color math runs first; blur runs last so it smooths the final colors.
    pub const ALL: [FilterKind; 8] = [
        FilterKind::Brightness,
        FilterKind::Contrast,
        FilterKind::Saturation,
        FilterKind::Hue,
        FilterKind::Sepia,
        FilterKind::Grayscale,
        FilterKind::Invert,
        FilterKind::Blur,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Brightness => "brightness",
            Self::Contrast => "contrast",
            Self::Saturation => "saturation",
            Self::Blur => "blur",
            Self::Sepia => "sepia",
            Self::Hue => "hue",
            Self::Grayscale => "grayscale",
            Self::Invert => "invert",
        }
    }

    /// Inclusive value range accepted from the UI.
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::Brightness | Self::Contrast | Self::Saturation => (-100.0, 100.0),
            Self::Hue => (0.0, 360.0),
            Self::Sepia | Self::Grayscale | Self::Invert => (0.0, 100.0),
            Self::Blur => (0.0, 20.0),
        }
    }

    pub fn clamp(self, value: f64) -> f64 {
        let (min, max) = self.range();
        value.clamp(min, max)
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown filter '{0}'")]
pub struct UnknownFilter(pub String);

impl FromStr for FilterKind {
    type Err = UnknownFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownFilter(s.to_string()))
    }
}

/// Complete numeric filter configuration at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterState {
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub blur: f64,
    pub sepia: f64,
    pub hue: f64,
    pub grayscale: f64,
    pub invert: f64,
}

impl FilterState {
    pub fn get(&self, kind: FilterKind) -> f64 {
        match kind {
            FilterKind::Brightness => self.brightness,
            FilterKind::Contrast => self.contrast,
            FilterKind::Saturation => self.saturation,
            FilterKind::Blur => self.blur,
            FilterKind::Sepia => self.sepia,
            FilterKind::Hue => self.hue,
            FilterKind::Grayscale => self.grayscale,
            FilterKind::Invert => self.invert,
        }
    }

    pub fn set(&mut self, kind: FilterKind, value: f64) {
        let slot = match kind {
            FilterKind::Brightness => &mut self.brightness,
            FilterKind::Contrast => &mut self.contrast,
            FilterKind::Saturation => &mut self.saturation,
            FilterKind::Blur => &mut self.blur,
            FilterKind::Sepia => &mut self.sepia,
            FilterKind::Hue => &mut self.hue,
            FilterKind::Grayscale => &mut self.grayscale,
            FilterKind::Invert => &mut self.invert,
        };
        *slot = value;
    }

    pub fn with(mut self, kind: FilterKind, value: f64) -> Self {
        self.set(kind, value);
        self
    }

    /// `(kind, value)` pairs in application order.
    pub fn iter(&self) -> impl Iterator<Item = (FilterKind, f64)> + '_ {
        FilterKind::ALL.into_iter().map(|k| (k, self.get(k)))
    }

    pub fn is_neutral(&self) -> bool {
        self.iter().all(|(_, v)| v == 0.0)
    }

    /// One filter operation per non-neutral filter, in application order.
    ///
    /// Hue values that are whole turns are neutral as well.
    pub fn to_operations(&self) -> Vec<Operation> {
        self.iter()
            .filter(|&(kind, value)| match kind {
                FilterKind::Hue => value.rem_euclid(360.0) != 0.0,
                _ => value != 0.0,
            })
            .map(|(kind, value)| Operation::filter(kind, value))
            .collect()
    }
}

/// Names accepted by [`preset`], in display order.
pub const PRESET_NAMES: &[&str] = &[
    "none",
    "vintage",
    "black-and-white",
    "warm",
    "cool",
    "dramatic",
    "vivid",
    "fade",
];

/// Look up a named preset. Unset filters stay at their neutral value.
pub fn preset(name: &str) -> Option<FilterState> {
    let base = FilterState::default();
    let state = match name.trim().to_ascii_lowercase().as_str() {
        "none" => base,
        "vintage" => base
            .with(FilterKind::Sepia, 40.0)
            .with(FilterKind::Contrast, -10.0)
            .with(FilterKind::Brightness, 10.0)
            .with(FilterKind::Saturation, -20.0),
        "black-and-white" | "bw" => base
            .with(FilterKind::Grayscale, 100.0)
            .with(FilterKind::Contrast, 20.0),
        "warm" => base
            .with(FilterKind::Sepia, 15.0)
            .with(FilterKind::Saturation, 15.0)
            .with(FilterKind::Brightness, 5.0),
        "cool" => base
            .with(FilterKind::Hue, 15.0)
            .with(FilterKind::Saturation, -10.0),
        "dramatic" => base
            .with(FilterKind::Contrast, 40.0)
            .with(FilterKind::Saturation, 20.0)
            .with(FilterKind::Brightness, -10.0),
        "vivid" => base
            .with(FilterKind::Saturation, 40.0)
            .with(FilterKind::Contrast, 10.0),
        "fade" => base
            .with(FilterKind::Contrast, -30.0)
            .with(FilterKind::Brightness, 15.0)
            .with(FilterKind::Saturation, -30.0),
        _ => return None,
    };
    Some(state)
}
