/// Limits of the per-display framebuffer cache.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct FramebufferLimits {
    /// Above this many cached layers, layers unused in a frame are reclaimed at flip.
    #[knuffel(child, unwrap(argument), default = 16)]
    pub max_cached_layers: usize,
    #[knuffel(child, unwrap(argument), default = 32)]
    pub max_cached_buffers_per_layer: usize,
    /// Cap for protected layers composed through G2D.
    #[knuffel(child, unwrap(argument), default = 3)]
    pub max_cached_secure_buffers_per_g2d_layer: usize,
}

impl Default for FramebufferLimits {
    fn default() -> Self {
        Self {
            max_cached_layers: 16,
            max_cached_buffers_per_layer: 32,
            max_cached_secure_buffers_per_g2d_layer: 3,
        }
    }
}
