//! Tuning parameters for target selection and junction resolution.
//!
//! None of these constants are load-bearing for correctness: they bias the
//! cost function towards cheaper placements and bound how many registers a
//! nested relocation may consume. Defaults match the values the allocator was
//! tuned with on x86; other targets may want to re-derive them.

use std::env;

/// Heuristic costs and reserves used by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Cost of stealing a register whose occupant also lives elsewhere.
    pub steal_cost: u32,
    /// Cost of stealing a register holding the occupant's only copy.
    pub steal_unique_cost: u32,
    /// Cost of a free frame slot at the value's home index.
    pub frame_cost: u32,
    /// Penalty added to register candidates once free registers run low.
    pub low_register_penalty: u32,
    /// Free registers, beyond the request's reserve, at or below which the
    /// penalty applies.
    pub low_register_threshold: u32,
    /// Registers kept out of reach while resolving a junction.
    pub resolve_register_reserve: u32,
    /// Registers kept out of reach while relocating a stolen value.
    pub steal_register_reserve: u32,
    /// Candidates costing more than this fall back to a full frame scan.
    pub frame_scan_threshold: u32,
    /// Alignment applied to blocks that are targets of back edges.
    pub loop_header_alignment: Option<u32>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            steal_cost: 2,
            steal_unique_cost: 4,
            frame_cost: 1,
            low_register_penalty: 10,
            low_register_threshold: 0,
            resolve_register_reserve: 2,
            steal_register_reserve: 1,
            frame_scan_threshold: 3,
            loop_header_alignment: None,
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `SITEALLOC_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let read = |name: &str, slot: &mut u32| {
            if let Ok(text) = env::var(name) {
                match text.parse() {
                    Ok(value) => *slot = value,
                    Err(_) => log::warn!("ignoring {name}={text}: not an unsigned integer"),
                }
            }
        };
        read("SITEALLOC_STEAL_COST", &mut config.steal_cost);
        read("SITEALLOC_STEAL_UNIQUE_COST", &mut config.steal_unique_cost);
        read("SITEALLOC_FRAME_COST", &mut config.frame_cost);
        read("SITEALLOC_LOW_REGISTER_PENALTY", &mut config.low_register_penalty);
        read("SITEALLOC_LOW_REGISTER_THRESHOLD", &mut config.low_register_threshold);
        read("SITEALLOC_RESOLVE_RESERVE", &mut config.resolve_register_reserve);
        read("SITEALLOC_STEAL_RESERVE", &mut config.steal_register_reserve);
        read("SITEALLOC_FRAME_SCAN_THRESHOLD", &mut config.frame_scan_threshold);
        let mut alignment = 0;
        read("SITEALLOC_LOOP_ALIGNMENT", &mut alignment);
        if alignment > 1 {
            config.loop_header_alignment = Some(alignment);
        }
        config
    }

    pub fn with_resolve_register_reserve(mut self, reserve: u32) -> Self {
        self.resolve_register_reserve = reserve;
        self
    }

    pub fn with_steal_register_reserve(mut self, reserve: u32) -> Self {
        self.steal_register_reserve = reserve;
        self
    }

    pub fn with_low_register_threshold(mut self, threshold: u32) -> Self {
        self.low_register_threshold = threshold;
        self
    }

    pub fn with_loop_header_alignment(mut self, alignment: Option<u32>) -> Self {
        self.loop_header_alignment = alignment.filter(|a| *a > 1);
        self
    }
}
