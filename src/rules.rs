//! Interface to the type-rule engine.
//!
//! The rule engine resolves some ambiguous types deterministically. The
//! builder only consumes its verdicts; matching rules is someone else's job.

use crate::core::instance::Instance;

/// Verdict of the rule engine for one instance access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleVerdict {
    NoMatch,
    /// A rule applies and yields this instance, possibly of another type.
    Match(Instance),
    Ambiguous,
    Deferred,
}

impl RuleVerdict {
    /// The resolved instance, if any. Ambiguous and deferred verdicts carry
    /// no answer, the same as no match.
    pub fn into_match(self) -> Option<Instance> {
        match self {
            RuleVerdict::Match(inst) => Some(inst),
            RuleVerdict::NoMatch | RuleVerdict::Ambiguous | RuleVerdict::Deferred => None,
        }
    }
}

/// Opaque oracle consulted before structural candidate enumeration.
pub trait RuleOracle: Send + Sync {
    /// Number of loaded rules. Zero disables rule-based resolution.
    fn rule_count(&self) -> usize;

    /// Resolve the member reached from `inst` through `member_path`.
    fn resolve(&self, inst: &Instance, member_path: &[usize]) -> RuleVerdict;
}

/// Rule engine with no rules loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl RuleOracle for NoRules {
    fn rule_count(&self) -> usize {
        0
    }

    fn resolve(&self, _inst: &Instance, _member_path: &[usize]) -> RuleVerdict {
        RuleVerdict::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_type::TypeId;

    #[test]
    fn only_match_yields_instance() {
        let inst = Instance::new(0x1000, TypeId(3), "x");
        assert_eq!(RuleVerdict::Match(inst.clone()).into_match(), Some(inst));
        assert_eq!(RuleVerdict::Ambiguous.into_match(), None);
        assert_eq!(RuleVerdict::Deferred.into_match(), None);
        assert_eq!(RuleVerdict::NoMatch.into_match(), None);
    }

    #[test]
    fn no_rules_never_matches() {
        let inst = Instance::new(0x1000, TypeId(3), "x");
        assert_eq!(NoRules.rule_count(), 0);
        assert_eq!(NoRules.resolve(&inst, &[0, 1]), RuleVerdict::NoMatch);
    }
}
