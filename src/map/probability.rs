//! Multiplicative plausibility score of an instance.
//!
//! The score starts at 1.0 and every failed check multiplies it by the
//! remaining fraction `1 - deg`. Only declared members are visited; objects
//! reached through pointers are scored on their own when the builder gets
//! there.

use crate::config::ProbabilityConfig;
use crate::core::data_type::DataTypeKind;
use crate::core::instance::Instance;
use crate::map::heuristics::Heuristics;

/// Nesting of embedded structs beyond this is not scored.
const MAX_MEMBER_DEPTH: u32 = 32;

#[derive(Clone, Copy)]
pub struct ProbabilityModel<'a> {
    heuristics: Heuristics<'a>,
    config: &'a ProbabilityConfig,
}

impl<'a> ProbabilityModel<'a> {
    pub fn new(heuristics: Heuristics<'a>, config: &'a ProbabilityConfig) -> Self {
        Self { heuristics, config }
    }

    /// Score in `[0, 1]` for `inst` alone.
    pub fn probability(&self, inst: &Instance) -> f32 {
        self.score(inst, 0).clamp(0.0, 1.0)
    }

    /// Score of an instance that failed to materialise.
    pub fn invalid_instance(&self) -> f32 {
        1.0 - self.config.deg_invalid_instance
    }

    fn score(&self, inst: &Instance, depth: u32) -> f32 {
        let h = &self.heuristics;
        let cfg = self.config;
        let mut p = 1.0f32;

        if !h.is_valid_instance(inst) {
            return p * (1.0 - cfg.deg_invalid_instance);
        }

        if h.is_function_pointer(inst) {
            if !h.valid_function_pointer(inst, true) {
                p *= 1.0 - cfg.deg_invalid_pointer;
            }
            return p;
        }

        let Some(dt) = h.resolver.base_type(inst) else {
            return p;
        };
        match dt.kind {
            DataTypeKind::Pointer => {
                if !h.valid_pointer(inst, true) {
                    p *= 1.0 - cfg.deg_invalid_pointer;
                }
            }
            DataTypeKind::Struct => {
                if !h.resolver.passes_magic(inst) {
                    p *= 1.0 - cfg.deg_invalid_magic;
                }
                if depth >= MAX_MEMBER_DEPTH {
                    return p;
                }
                for idx in 0..dt.members().len() {
                    let Some(member) = h.resolver.member(inst, idx) else {
                        p *= self.invalid_instance();
                        continue;
                    };
                    // Empty members occupy no bytes to judge.
                    if h.resolver.size_of(&member) == 0 {
                        continue;
                    }
                    if h.is_list_head(&member) {
                        if !h.valid_list_head(&member, true) {
                            p *= 1.0 - cfg.deg_invalid_list_head;
                        }
                    } else {
                        p *= self.score(&member, depth + 1);
                    }
                }
            }
            _ => {}
        }
        p
    }
}
