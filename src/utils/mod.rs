use std::time::Duration;

pub mod dirty;

pub use dirty::DirtyCell;

/// Current CLOCK_MONOTONIC time, the clock DRM vblank timestamps use.
pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes into the provided timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Linear interpolation of `x` from `[x0, x1]` onto `[y0, y1]`.
pub fn lerp(x: f32, x0: f32, x1: f32, y0: f32, y1: f32) -> f32 {
    if x1 == x0 {
        return y0;
    }
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}
