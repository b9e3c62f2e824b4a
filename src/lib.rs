//! DRM/KMS backend of a hardware composer for Exynos display pipelines.

pub mod backend;
pub mod brightness;
pub mod capability;
pub mod context;
pub mod error;
pub mod utils;
