//! Property lookup for CRTCs, connectors and planes, and HAL to DRM enum translation.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::device::{KmsDevice, ObjectType, PropertyDesc, PropertyKind};
use crate::error::{HwcError, Result};

/// A property resolved by name. Properties the kernel does not expose have id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrmProperty {
    name: &'static str,
    desc: Option<PropertyDesc>,
}

impl DrmProperty {
    pub fn missing(name: &'static str) -> Self {
        Self { name, desc: None }
    }

    pub fn new(name: &'static str, desc: PropertyDesc) -> Self {
        Self {
            name,
            desc: Some(desc),
        }
    }

    pub fn id(&self) -> u32 {
        self.desc.as_ref().map_or(0, |desc| desc.id)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_available(&self) -> bool {
        self.desc.is_some()
    }

    pub fn is_immutable(&self) -> bool {
        self.desc.as_ref().is_some_and(|desc| desc.immutable)
    }

    /// The value the kernel reported when the property was resolved.
    pub fn initial_value(&self) -> Option<u64> {
        self.desc.as_ref().map(|desc| desc.value)
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        match self.desc.as_ref()?.kind {
            PropertyKind::Range { min, max } => Some((min, max)),
            _ => None,
        }
    }

    /// Value of a named enum entry, or bit index of a named bitmask entry.
    pub fn enum_value(&self, entry: &str) -> Option<u64> {
        let entries = match &self.desc.as_ref()?.kind {
            PropertyKind::Enum(entries) | PropertyKind::Bitmask(entries) => entries,
            _ => return None,
        };
        entries
            .iter()
            .find_map(|(name, value)| (name == entry).then_some(*value))
    }
}

/// All properties of one KMS object.
pub struct PropertySet {
    object_id: u32,
    props: Vec<PropertyDesc>,
}

impl PropertySet {
    pub fn query(device: &dyn KmsDevice, object_id: u32, ty: ObjectType) -> Result<Self> {
        let props = device
            .properties(object_id, ty)
            .map_err(|err| HwcError::drm("get object properties", err))?;
        Ok(Self { object_id, props })
    }

    pub fn get(&self, name: &'static str) -> DrmProperty {
        match self.props.iter().find(|desc| desc.name == name) {
            Some(desc) => DrmProperty::new(name, desc.clone()),
            None => {
                debug!("object {} has no {name} property", self.object_id);
                DrmProperty::missing(name)
            }
        }
    }
}

// =============================================================================
// Object properties
// =============================================================================

#[derive(Debug, Clone)]
pub struct CrtcProps {
    pub active: DrmProperty,
    pub mode_id: DrmProperty,
    pub out_fence_ptr: DrmProperty,
    pub partial_region: DrmProperty,
}

impl CrtcProps {
    pub fn resolve(set: &PropertySet) -> Self {
        Self {
            active: set.get("ACTIVE"),
            mode_id: set.get("MODE_ID"),
            out_fence_ptr: set.get("OUT_FENCE_PTR"),
            partial_region: set.get("partial_region"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorProps {
    pub crtc_id: DrmProperty,
    pub dpms: DrmProperty,
    pub brightness_capability: DrmProperty,
    pub brightness_level: DrmProperty,
    pub hbm_mode: DrmProperty,
    pub dimming_on: DrmProperty,
    pub lhbm_on: DrmProperty,
    pub mipi_sync: DrmProperty,
    pub writeback_fb_id: DrmProperty,
    pub writeback_out_fence_ptr: DrmProperty,
    pub hbm_modes: EnumMap,
    pub mipi_sync_bits: EnumMap,
}

impl ConnectorProps {
    pub fn resolve(set: &PropertySet) -> Self {
        let hbm_mode = set.get("hbm_mode");
        let mipi_sync = set.get("mipi_sync");
        let hbm_modes = EnumMap::parse(&hbm_mode, HBM_MODE_NAMES);
        let mipi_sync_bits = EnumMap::parse(&mipi_sync, MIPI_SYNC_NAMES);

        Self {
            crtc_id: set.get("CRTC_ID"),
            dpms: set.get("DPMS"),
            brightness_capability: set.get("brightness_capability"),
            brightness_level: set.get("brightness_level"),
            hbm_mode,
            dimming_on: set.get("dimming_on"),
            lhbm_on: set.get("lhbm_on"),
            mipi_sync,
            writeback_fb_id: set.get("WRITEBACK_FB_ID"),
            writeback_out_fence_ptr: set.get("WRITEBACK_OUT_FENCE_PTR"),
            hbm_modes,
            mipi_sync_bits,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaneProps {
    pub fb_id: DrmProperty,
    pub crtc_id: DrmProperty,
    pub crtc_x: DrmProperty,
    pub crtc_y: DrmProperty,
    pub crtc_w: DrmProperty,
    pub crtc_h: DrmProperty,
    pub src_x: DrmProperty,
    pub src_y: DrmProperty,
    pub src_w: DrmProperty,
    pub src_h: DrmProperty,
    pub rotation: DrmProperty,
    pub blend: DrmProperty,
    pub zpos: DrmProperty,
    pub alpha: DrmProperty,
    pub in_fence_fd: DrmProperty,
    pub colormap: DrmProperty,
    pub standard: DrmProperty,
    pub transfer: DrmProperty,
    pub range: DrmProperty,
    pub min_luminance: DrmProperty,
    pub max_luminance: DrmProperty,
    pub blend_modes: EnumMap,
    pub standards: EnumMap,
    pub transfers: EnumMap,
    pub ranges: EnumMap,
}

impl PlaneProps {
    pub fn resolve(set: &PropertySet) -> Self {
        let blend = set.get("pixel blend mode");
        let standard = set.get("standard");
        let transfer = set.get("transfer");
        let range = set.get("range");

        Self {
            fb_id: set.get("FB_ID"),
            crtc_id: set.get("CRTC_ID"),
            crtc_x: set.get("CRTC_X"),
            crtc_y: set.get("CRTC_Y"),
            crtc_w: set.get("CRTC_W"),
            crtc_h: set.get("CRTC_H"),
            src_x: set.get("SRC_X"),
            src_y: set.get("SRC_Y"),
            src_w: set.get("SRC_W"),
            src_h: set.get("SRC_H"),
            rotation: set.get("rotation"),
            zpos: set.get("zpos"),
            alpha: set.get("alpha"),
            in_fence_fd: set.get("IN_FENCE_FD"),
            colormap: set.get("colormap"),
            min_luminance: set.get("min_luminance"),
            max_luminance: set.get("max_luminance"),
            blend_modes: EnumMap::parse(&blend, BLEND_MODE_NAMES),
            standards: EnumMap::parse(&standard, STANDARD_NAMES),
            transfers: EnumMap::parse(&transfer, TRANSFER_NAMES),
            ranges: EnumMap::parse(&range, RANGE_NAMES),
            blend,
            standard,
            transfer,
            range,
        }
    }
}

// =============================================================================
// Enum tables
// =============================================================================

/// Maps HAL values to the enum values (or bit indices) one kernel object advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumMap {
    property: &'static str,
    values: HashMap<u64, u64>,
}

impl EnumMap {
    pub fn parse(prop: &DrmProperty, table: &[(u64, &str)]) -> Self {
        let mut values = HashMap::new();
        if prop.is_available() {
            for &(hal, name) in table {
                match prop.enum_value(name) {
                    Some(value) => {
                        values.insert(hal, value);
                    }
                    None => warn!("{} does not support {name:?}", prop.name()),
                }
            }
        }

        Self {
            property: prop.name(),
            values,
        }
    }

    pub fn get(&self, hal: u64) -> Result<u64> {
        self.values.get(&hal).copied().ok_or_else(|| {
            HwcError::BadValue(format!("{} has no value for {hal:#x}", self.property))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// HWC2 blend modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BlendMode {
    None = 1,
    Premultiplied = 2,
    Coverage = 3,
}

/// Panel HBM state as set through the `hbm_mode` connector property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u64)]
pub enum HbmMode {
    #[default]
    Off = 0,
    /// Global HBM with IR compensation.
    OnIrcOn = 1,
    /// Global HBM without IR compensation, used for sunlight visibility.
    OnIrcOff = 2,
}

/// Panel commands that must be applied in the same frame as the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MipiSync {
    RefreshRate = 0,
    Lhbm = 1,
    Ghbm = 2,
    Backlight = 3,
}

pub const BLEND_MODE_NAMES: &[(u64, &str)] = &[
    (BlendMode::None as u64, "None"),
    (BlendMode::Premultiplied as u64, "Pre-multiplied"),
    (BlendMode::Coverage as u64, "Coverage"),
];

pub const HBM_MODE_NAMES: &[(u64, &str)] = &[
    (HbmMode::Off as u64, "Off"),
    (HbmMode::OnIrcOn as u64, "On IRC On"),
    (HbmMode::OnIrcOff as u64, "On IRC Off"),
];

pub const MIPI_SYNC_NAMES: &[(u64, &str)] = &[
    (MipiSync::RefreshRate as u64, "sync_refresh_rate"),
    (MipiSync::Lhbm as u64, "sync_lhbm"),
    (MipiSync::Ghbm as u64, "sync_ghbm"),
    (MipiSync::Backlight as u64, "sync_bl"),
];

// Android dataspace fields. The HAL values in the tables below are already shifted into place.
pub const DATASPACE_STANDARD_SHIFT: u32 = 16;
pub const DATASPACE_STANDARD_MASK: u32 = 63 << DATASPACE_STANDARD_SHIFT;
pub const DATASPACE_TRANSFER_SHIFT: u32 = 22;
pub const DATASPACE_TRANSFER_MASK: u32 = 31 << DATASPACE_TRANSFER_SHIFT;
pub const DATASPACE_RANGE_SHIFT: u32 = 27;
pub const DATASPACE_RANGE_MASK: u32 = 7 << DATASPACE_RANGE_SHIFT;

pub const TRANSFER_ST2084: u32 = 7 << DATASPACE_TRANSFER_SHIFT;
pub const TRANSFER_HLG: u32 = 8 << DATASPACE_TRANSFER_SHIFT;

const fn standard(v: u64) -> u64 {
    v << DATASPACE_STANDARD_SHIFT
}

const fn transfer(v: u64) -> u64 {
    v << DATASPACE_TRANSFER_SHIFT
}

const fn range(v: u64) -> u64 {
    v << DATASPACE_RANGE_SHIFT
}

pub const STANDARD_NAMES: &[(u64, &str)] = &[
    (standard(0), "Unspecified"),
    (standard(1), "BT709"),
    (standard(2), "BT601_625"),
    (standard(3), "BT601_625_UNADJUSTED"),
    (standard(4), "BT601_525"),
    (standard(5), "BT601_525_UNADJUSTED"),
    (standard(6), "BT2020"),
    (standard(7), "BT2020_CONSTANT_LUMINANCE"),
    (standard(8), "BT470M"),
    (standard(9), "FILM"),
    (standard(10), "DCI-P3"),
    (standard(11), "Adobe RGB"),
];

pub const TRANSFER_NAMES: &[(u64, &str)] = &[
    (transfer(0), "Unspecified"),
    (transfer(1), "Linear"),
    (transfer(2), "sRGB"),
    (transfer(3), "SMPTE 170M"),
    (transfer(4), "Gamma 2.2"),
    (transfer(5), "Gamma 2.6"),
    (transfer(6), "Gamma 2.8"),
    (transfer(7), "ST2084"),
    (transfer(8), "HLG"),
];

pub const RANGE_NAMES: &[(u64, &str)] = &[
    (range(0), "Unspecified"),
    (range(1), "Full"),
    (range(2), "Limited"),
    (range(3), "Extended"),
];

// =============================================================================
// Rotation
// =============================================================================

pub const DRM_MODE_ROTATE_0: u64 = 1 << 0;
pub const DRM_MODE_ROTATE_90: u64 = 1 << 1;
pub const DRM_MODE_ROTATE_180: u64 = 1 << 2;
pub const DRM_MODE_ROTATE_270: u64 = 1 << 3;
pub const DRM_MODE_REFLECT_X: u64 = 1 << 4;
pub const DRM_MODE_REFLECT_Y: u64 = 1 << 5;

const HAL_TRANSFORM_FLIP_H: u32 = 0x01;
const HAL_TRANSFORM_FLIP_V: u32 = 0x02;
const HAL_TRANSFORM_ROT_90: u32 = 0x04;
const HAL_TRANSFORM_ROT_180: u32 = 0x03;
const HAL_TRANSFORM_ROT_270: u32 = 0x07;
const HAL_TRANSFORM_FLIP_H_ROT_90: u32 = HAL_TRANSFORM_FLIP_H | HAL_TRANSFORM_ROT_90;
const HAL_TRANSFORM_FLIP_V_ROT_90: u32 = HAL_TRANSFORM_FLIP_V | HAL_TRANSFORM_ROT_90;

/// Converts a HAL layer transform into `rotation` property bits.
pub fn hal_transform_to_rotation(transform: u32) -> Result<u64> {
    let rotation = match transform {
        0 => DRM_MODE_ROTATE_0,
        HAL_TRANSFORM_FLIP_H => DRM_MODE_REFLECT_Y | DRM_MODE_ROTATE_0,
        HAL_TRANSFORM_FLIP_V => DRM_MODE_REFLECT_X | DRM_MODE_ROTATE_0,
        HAL_TRANSFORM_ROT_180 => DRM_MODE_ROTATE_180,
        HAL_TRANSFORM_ROT_90 => DRM_MODE_ROTATE_90,
        HAL_TRANSFORM_FLIP_H_ROT_90 => DRM_MODE_REFLECT_Y | DRM_MODE_ROTATE_90,
        HAL_TRANSFORM_FLIP_V_ROT_90 => DRM_MODE_REFLECT_X | DRM_MODE_ROTATE_90,
        HAL_TRANSFORM_ROT_270 => DRM_MODE_ROTATE_270,
        other => return Err(HwcError::BadValue(format!("unknown transform {other:#x}"))),
    };
    Ok(rotation)
}
