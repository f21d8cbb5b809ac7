//! Tunables and internal constants.

/// Host-adjustable pacing parameters.
#[derive(Clone, Copy, Debug)]
pub struct GcConfig {
    /// Percentage of live-bytes growth to wait for before starting the
    /// next incremental cycle. Default 200 (wait for the heap to double).
    pub gcpause: i32,
    /// Percentage multiplier applied to debt to compute work per
    /// incremental step. Default 100.
    pub gcstepmul: i32,
    /// log2(bytes) step size. Default 13 (8 KiB).
    pub gcstepsize: i32,
    /// Minor-collection promotion multiplier, generational mode. Default 20.
    pub genminormul: i32,
    /// Major-collection multiplier, generational mode. Default 100.
    pub genmajormul: i32,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            gcpause: 200,
            gcstepmul: 100,
            gcstepsize: 13,
            genminormul: 20,
            genmajormul: 100,
        }
    }
}

impl GcConfig {
    pub fn step_size_bytes(&self) -> isize {
        1isize << self.gcstepsize
    }
}

/// Internal constants, never host-tunable.
pub const SWEEP_MAX: usize = 100;
pub const FIN_MAX: usize = 10;
pub const FIN_COST: isize = 50;
pub const PAUSE_ADJ: isize = 100;

/// Threshold (as a count of objects promoted straight to old in one minor
/// cycle) above which a generational minor cycle gives way to a one-shot
/// major cycle, scaled by `genmajormul` (SPEC_FULL `genstep` supplement,
/// grounded in `lgc.c`'s `genstep`/`checkminor` major-switch heuristic).
pub const GEN_MAJOR_PROMOTION_DIVISOR: isize = 100;
