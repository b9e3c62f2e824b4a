//! HAL pixel formats, Exynos format modifiers and framebuffer plane layouts.

use drm::buffer::DrmFourcc;

use super::device::{FramebufferSpec, FB_FLAG_MODIFIERS};
use crate::error::{HwcError, Result};
use crate::utils::align_up;

// =============================================================================
// Modifiers
// =============================================================================

const DRM_FORMAT_MOD_VENDOR_SAMSUNG: u64 = 0x04;
const DRM_FORMAT_MOD_VENDOR_ARM: u64 = 0x08;

pub const fn fourcc_mod_code(vendor: u64, value: u64) -> u64 {
    (vendor << 56) | (value & 0x00ff_ffff_ffff_ffff)
}

pub const AFBC_FORMAT_MOD_BLOCK_SIZE_16X16: u64 = 1;
pub const AFBC_FORMAT_MOD_YTR: u64 = 1 << 4;
/// Which engine produced an AFBC buffer.
pub const AFBC_FORMAT_MOD_SOURCE_GPU: u64 = 1 << 52;
pub const AFBC_FORMAT_MOD_SOURCE_G2D: u64 = 2 << 52;

pub const SBWC_IDENTIFIER: u64 = 1 << 4;
pub const SBWC_FORMAT_MOD_BLOCK_SIZE_32X4: u64 = 2 << 5;
pub const SBWC_FORMAT_MOD_LOSSY: u64 = 1 << 12;

/// Solid colour plane; the plane's `colormap` property carries the colour.
pub const DRM_FORMAT_MOD_SAMSUNG_COLORMAP: u64 = fourcc_mod_code(DRM_FORMAT_MOD_VENDOR_SAMSUNG, 2);
/// Buffer lives in protected memory.
pub const DRM_FORMAT_MOD_PROTECTION: u64 = 1 << 51;

pub const fn afbc_modifier(flags: u64) -> u64 {
    fourcc_mod_code(DRM_FORMAT_MOD_VENDOR_ARM, flags)
}

pub const fn sbwc_modifier(flags: u64) -> u64 {
    fourcc_mod_code(DRM_FORMAT_MOD_VENDOR_SAMSUNG, SBWC_IDENTIFIER | flags)
}

/// Compression applied to a buffer by its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Afbc {
        from_g2d: bool,
    },
    Sbwc {
        lossy: bool,
    },
}

impl Compression {
    fn modifier(self) -> u64 {
        match self {
            Compression::None => 0,
            Compression::Afbc { from_g2d } => {
                let source = if from_g2d {
                    AFBC_FORMAT_MOD_SOURCE_G2D
                } else {
                    AFBC_FORMAT_MOD_SOURCE_GPU
                };
                afbc_modifier(AFBC_FORMAT_MOD_BLOCK_SIZE_16X16 | AFBC_FORMAT_MOD_YTR | source)
            }
            Compression::Sbwc { lossy } => {
                let mut flags = SBWC_FORMAT_MOD_BLOCK_SIZE_32X4;
                if lossy {
                    flags |= SBWC_FORMAT_MOD_LOSSY;
                }
                sbwc_modifier(flags)
            }
        }
    }
}

// =============================================================================
// HAL formats
// =============================================================================

pub const HAL_PIXEL_FORMAT_RGBA_8888: u32 = 1;
pub const HAL_PIXEL_FORMAT_RGBX_8888: u32 = 2;
pub const HAL_PIXEL_FORMAT_RGB_888: u32 = 3;
pub const HAL_PIXEL_FORMAT_RGB_565: u32 = 4;
pub const HAL_PIXEL_FORMAT_BGRA_8888: u32 = 5;
pub const HAL_PIXEL_FORMAT_YCRCB_420_SP: u32 = 0x11;
pub const HAL_PIXEL_FORMAT_RGBA_FP16: u32 = 0x16;
pub const HAL_PIXEL_FORMAT_RGBA_1010102: u32 = 0x2b;
pub const HAL_PIXEL_FORMAT_YCBCR_P010: u32 = 0x36;
pub const HAL_PIXEL_FORMAT_YV12: u32 = 0x3231_5659;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M: u32 = 0x105;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN: u32 = 0x11d;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_P010_M: u32 = 0x11f;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M_SBWC: u32 = 0x121;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN_SBWC: u32 = 0x122;
pub const HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN_10B_SBWC: u32 = 0x124;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDesc {
    pub hal: u32,
    pub drm: DrmFourcc,
    /// Number of memory buffers (fds).
    pub buffers: usize,
    /// Number of image planes.
    pub planes: usize,
    /// Bits per pixel of each plane, relative to the luma width.
    pub bpp: [u32; 3],
    pub sbwc: bool,
    pub ten_bit: bool,
}

const fn desc(hal: u32, drm: DrmFourcc, buffers: usize, planes: usize, bpp: [u32; 3]) -> FormatDesc {
    FormatDesc {
        hal,
        drm,
        buffers,
        planes,
        bpp,
        sbwc: false,
        ten_bit: false,
    }
}

const fn sbwc(hal: u32, drm: DrmFourcc, buffers: usize, ten_bit: bool) -> FormatDesc {
    let bpp = if ten_bit { [16, 16, 0] } else { [8, 8, 0] };
    FormatDesc {
        hal,
        drm,
        buffers,
        planes: 2,
        bpp,
        sbwc: true,
        ten_bit,
    }
}

pub const FORMATS: &[FormatDesc] = &[
    desc(HAL_PIXEL_FORMAT_RGBA_8888, DrmFourcc::Abgr8888, 1, 1, [32, 0, 0]),
    desc(HAL_PIXEL_FORMAT_RGBX_8888, DrmFourcc::Xbgr8888, 1, 1, [32, 0, 0]),
    desc(HAL_PIXEL_FORMAT_RGB_888, DrmFourcc::Bgr888, 1, 1, [24, 0, 0]),
    desc(HAL_PIXEL_FORMAT_RGB_565, DrmFourcc::Rgb565, 1, 1, [16, 0, 0]),
    desc(HAL_PIXEL_FORMAT_BGRA_8888, DrmFourcc::Argb8888, 1, 1, [32, 0, 0]),
    desc(HAL_PIXEL_FORMAT_RGBA_FP16, DrmFourcc::Abgr16161616f, 1, 1, [64, 0, 0]),
    desc(HAL_PIXEL_FORMAT_RGBA_1010102, DrmFourcc::Abgr2101010, 1, 1, [32, 0, 0]),
    desc(HAL_PIXEL_FORMAT_YCRCB_420_SP, DrmFourcc::Nv21, 1, 2, [8, 8, 0]),
    desc(HAL_PIXEL_FORMAT_YV12, DrmFourcc::Yvu420, 1, 3, [8, 4, 4]),
    desc(HAL_PIXEL_FORMAT_YCBCR_P010, DrmFourcc::P010, 1, 2, [16, 16, 0]),
    desc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M, DrmFourcc::Nv12, 2, 2, [8, 8, 0]),
    desc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN, DrmFourcc::Nv12, 1, 2, [8, 8, 0]),
    desc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_P010_M, DrmFourcc::P010, 2, 2, [16, 16, 0]),
    sbwc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SP_M_SBWC, DrmFourcc::Nv12, 2, false),
    sbwc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN_SBWC, DrmFourcc::Nv12, 1, false),
    sbwc(HAL_PIXEL_FORMAT_EXYNOS_YCBCR_420_SPN_10B_SBWC, DrmFourcc::P010, 1, true),
];

pub fn format_desc(hal: u32) -> Result<&'static FormatDesc> {
    FORMATS
        .iter()
        .find(|desc| desc.hal == hal)
        .ok_or_else(|| HwcError::BadValue(format!("unsupported pixel format {hal:#x}")))
}

// =============================================================================
// SBWC geometry
// =============================================================================

fn sbwc_stride(width: u32, ten_bit: bool) -> u32 {
    let block = if ten_bit { 160 } else { 128 };
    block * width.div_ceil(32)
}

fn sbwc_header_stride(width: u32) -> u32 {
    align_up(width.div_ceil(64), 16)
}

/// Length of the compressed luma payload plus its header.
fn sbwc_luma_size(width: u32, height: u32, ten_bit: bool) -> u32 {
    let rows = (align_up(height, 16) + 3) / 4;
    let payload = sbwc_stride(width, ten_bit) * rows + 64;
    let header = align_up(sbwc_header_stride(width) * rows + 256, 32);
    payload + header
}

// =============================================================================
// Layouts
// =============================================================================

/// Pitches, offsets and per-buffer plane assignment for one framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Which imported buffer backs each plane.
    pub buffer_index: [usize; 4],
}

/// Computes where each image plane lives inside the buffer(s) of a `width`x`height` image
/// with a row stride of `stride` pixels.
pub fn plane_layout(desc: &FormatDesc, stride: u32, height: u32) -> PlaneLayout {
    let mut layout = PlaneLayout::default();

    for plane in 0..desc.planes {
        layout.pitches[plane] = if desc.sbwc {
            sbwc_stride(stride, desc.ten_bit)
        } else {
            stride * desc.bpp[plane] / 8
        };
    }

    if desc.buffers == desc.planes {
        for plane in 0..desc.planes {
            layout.buffer_index[plane] = plane;
        }
        return layout;
    }

    // Every plane shares the first buffer.
    if desc.planes >= 2 {
        let luma = if desc.sbwc {
            sbwc_luma_size(stride, height, desc.ten_bit)
        } else {
            align_up(layout.pitches[0], 16) * align_up(height, 16)
        };
        layout.offsets[1] = luma;

        if desc.planes == 3 {
            layout.pitches[1] = align_up(layout.pitches[1], 16);
            layout.pitches[2] = layout.pitches[1];
            layout.offsets[2] = luma + layout.pitches[1] * height.div_ceil(2);
        }
    }

    layout
}

/// Builds the AddFB2 arguments for a buffer whose buffers were imported as `handles`.
pub fn buffer_framebuffer_spec(
    desc: &FormatDesc,
    width: u32,
    height: u32,
    stride: u32,
    handles: &[u32],
    compression: Compression,
    protected: bool,
) -> FramebufferSpec {
    let layout = plane_layout(desc, stride, height);

    let mut modifier = compression.modifier();
    if protected {
        modifier |= DRM_FORMAT_MOD_PROTECTION;
    }

    let mut spec = FramebufferSpec {
        width,
        height,
        format: desc.drm as u32,
        ..Default::default()
    };

    for plane in 0..desc.planes {
        spec.handles[plane] = handles.get(layout.buffer_index[plane]).copied().unwrap_or(0);
        spec.pitches[plane] = layout.pitches[plane];
        spec.offsets[plane] = layout.offsets[plane];
        spec.modifiers[plane] = modifier;
    }

    if modifier != 0 {
        spec.flags |= FB_FLAG_MODIFIERS;
    }

    spec
}

/// GEM handle placeholder for colormap planes; the kernel never dereferences it.
pub const COLORMAP_HANDLE: u32 = 0xff00_0000;

pub fn solid_color_framebuffer_spec(width: u32, height: u32) -> FramebufferSpec {
    FramebufferSpec {
        width,
        height,
        format: DrmFourcc::Bgra8888 as u32,
        handles: [COLORMAP_HANDLE, 0, 0, 0],
        pitches: [width * 4, 0, 0, 0],
        offsets: [0; 4],
        modifiers: [DRM_FORMAT_MOD_SAMSUNG_COLORMAP, 0, 0, 0],
        flags: FB_FLAG_MODIFIERS,
    }
}

/// Rejects AddFB2 arguments the Exynos DPU driver cannot scan out.
pub fn validate_framebuffer_spec(spec: &FramebufferSpec) -> Result<()> {
    if spec.width == 0 || spec.height == 0 {
        return Err(HwcError::BadValue(format!(
            "framebuffer size {}x{}",
            spec.width, spec.height
        )));
    }

    if spec.modifiers[0] == DRM_FORMAT_MOD_SAMSUNG_COLORMAP {
        if spec.format != DrmFourcc::Bgra8888 as u32 {
            return Err(HwcError::BadValue(format!(
                "colormap framebuffer with format {:#x}",
                spec.format
            )));
        }
        return Ok(());
    }

    if spec.handles[0] == 0 {
        return Err(HwcError::BadValue(String::from(
            "framebuffer without a buffer handle",
        )));
    }

    Ok(())
}
