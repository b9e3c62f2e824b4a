//! Piecewise-linear brightness table from the connector's `brightness_capability` blob.

use bytemuck::{Pod, Zeroable};

use crate::error::{HwcError, Result};
use crate::utils::lerp;

/// One brightness range as laid out by the panel driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BrightnessAttribute {
    pub nits_min: u32,
    pub nits_max: u32,
    pub level_min: u32,
    pub level_max: u32,
    pub percentage_min: u32,
    pub percentage_max: u32,
}

/// Payload of the `brightness_capability` blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BrightnessCapability {
    pub normal: BrightnessAttribute,
    pub hbm: BrightnessAttribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessRange {
    Normal,
    Hbm,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeMapping {
    pub bri_start: f32,
    pub bri_end: f32,
    pub bkl_start: u32,
    pub bkl_end: u32,
    pub nits_start: f32,
    pub nits_end: f32,
}

impl From<&BrightnessAttribute> for RangeMapping {
    fn from(attr: &BrightnessAttribute) -> Self {
        Self {
            bri_start: attr.percentage_min as f32 / 100.,
            bri_end: attr.percentage_max as f32 / 100.,
            bkl_start: attr.level_min,
            bkl_end: attr.level_max,
            nits_start: attr.nits_min as f32,
            nits_end: attr.nits_max as f32,
        }
    }
}

impl RangeMapping {
    fn level(&self, brightness: f32) -> u32 {
        let level = lerp(
            brightness,
            self.bri_start,
            self.bri_end,
            self.bkl_start as f32,
            self.bkl_end as f32,
        );
        (level + 0.5) as u32
    }

    fn nits(&self, brightness: f32) -> f32 {
        lerp(
            brightness,
            self.bri_start,
            self.bri_end,
            self.nits_start,
            self.nits_end,
        )
    }

    pub fn contains_level(&self, level: u32) -> bool {
        (self.bkl_start..=self.bkl_end).contains(&level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessQuery {
    pub level: u32,
    pub ghbm: bool,
    pub nits: f32,
}

impl BrightnessQuery {
    pub const OFF: Self = Self {
        level: 0,
        ghbm: false,
        nits: 0.,
    };
}

/// Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct BrightnessTable {
    normal: RangeMapping,
    hbm: RangeMapping,
}

impl BrightnessTable {
    pub fn new(capability: &BrightnessCapability) -> Self {
        Self {
            normal: RangeMapping::from(&capability.normal),
            hbm: RangeMapping::from(&capability.hbm),
        }
    }

    pub fn from_blob(data: &[u8]) -> Result<Self> {
        let capability: BrightnessCapability = bytemuck::try_pod_read_unaligned(data)
            .map_err(|err| {
                HwcError::BadValue(format!(
                    "brightness capability blob of {} bytes: {err}",
                    data.len()
                ))
            })?;
        Ok(Self::new(&capability))
    }

    pub fn range(&self, range: BrightnessRange) -> &RangeMapping {
        match range {
            BrightnessRange::Normal => &self.normal,
            BrightnessRange::Hbm => &self.hbm,
        }
    }

    /// Maps a brightness in `0.0..=1.0` to a backlight level. Negative brightness means off.
    pub fn query(&self, brightness: f32) -> Result<BrightnessQuery> {
        if brightness < 0. {
            return Ok(BrightnessQuery::OFF);
        }

        for (range, ghbm) in [(&self.normal, false), (&self.hbm, true)] {
            if brightness <= range.bri_end {
                return Ok(BrightnessQuery {
                    level: range.level(brightness),
                    ghbm,
                    nits: range.nits(brightness),
                });
            }
        }

        Err(HwcError::BadValue(format!(
            "brightness {brightness} is outside the table"
        )))
    }
}
