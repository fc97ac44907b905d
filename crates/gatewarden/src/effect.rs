//! Per-tuple effects and the aggregator that reduces them to a decision.

use crate::error::{Error, Result};

/// Effect sources recognized by the default aggregator, in their
/// normalized (reference-escaped) form.
pub(crate) const ALLOW_OVERRIDE_EFFECT: &str = "some(where (p_eft == allow))";
pub(crate) const DENY_OVERRIDE_EFFECT: &str = "!some(where (p_eft == deny))";
pub(crate) const ALLOW_AND_DENY_EFFECT: &str =
    "some(where (p_eft == allow)) && !some(where (p_eft == deny))";
pub(crate) const PRIORITY_EFFECT: &str = "priority(p_eft) || deny";
pub(crate) const PRIORITY_ALLOW_EFFECT: &str = "priority(p_eft) || allow";
pub(crate) const SUBJECT_PRIORITY_EFFECT: &str = "subjectPriority(p_eft) || deny";

/// The contribution of a single policy tuple to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Indeterminate,
    Deny,
}

/// Reduces the per-tuple `(effect, match weight)` stream into a decision.
///
/// `merge_effects` is called once per evaluated tuple with every result so
/// far; the caller stops iterating as soon as the returned effect is not
/// `Indeterminate`. The returned index designates the tuple that decided
/// the outcome, when one did.
pub trait Effector: Send + Sync {
    fn merge_effects(
        &self,
        expr: &str,
        effects: &[Effect],
        matches: &[f64],
        policy_index: usize,
        policy_len: usize,
    ) -> Result<(Effect, Option<usize>)>;
}

/// Aggregator for the recognized effect idioms.
#[derive(Debug, Default)]
pub struct DefaultEffector;

impl Effector for DefaultEffector {
    fn merge_effects(
        &self,
        expr: &str,
        effects: &[Effect],
        matches: &[f64],
        policy_index: usize,
        policy_len: usize,
    ) -> Result<(Effect, Option<usize>)> {
        let matched = matches[policy_index] != 0.0;
        let current = effects[policy_index];
        let last = policy_index + 1 == policy_len;

        match expr {
            ALLOW_OVERRIDE_EFFECT => {
                // Any matching allow decides; everything else stays open.
                if matched && current == Effect::Allow {
                    return Ok((Effect::Allow, Some(policy_index)));
                }
                Ok((Effect::Indeterminate, None))
            }
            DENY_OVERRIDE_EFFECT => {
                if matched && current == Effect::Deny {
                    return Ok((Effect::Deny, Some(policy_index)));
                }
                // The whole policy was scanned without a matching deny.
                if last {
                    return Ok((Effect::Allow, None));
                }
                Ok((Effect::Indeterminate, None))
            }
            ALLOW_AND_DENY_EFFECT => {
                if matched && current == Effect::Deny {
                    return Ok((Effect::Deny, Some(policy_index)));
                }
                if !last {
                    return Ok((Effect::Indeterminate, None));
                }
                for (i, effect) in effects.iter().enumerate() {
                    if matches[i] != 0.0 && *effect == Effect::Allow {
                        return Ok((Effect::Allow, Some(i)));
                    }
                }
                Ok((Effect::Indeterminate, None))
            }
            PRIORITY_EFFECT | SUBJECT_PRIORITY_EFFECT | PRIORITY_ALLOW_EFFECT => {
                // The first matching tuple with a definite effect decides;
                // the policy was pre-sorted so it is the highest-priority one.
                if matched && current != Effect::Indeterminate {
                    return Ok((current, Some(policy_index)));
                }
                if last && expr == PRIORITY_ALLOW_EFFECT {
                    return Ok((Effect::Allow, None));
                }
                Ok((Effect::Indeterminate, None))
            }
            other => Err(Error::UnsupportedEffect(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(expr: &str, stream: &[(Effect, f64)]) -> Result<(Effect, Option<usize>)> {
        let effector = DefaultEffector;
        let len = stream.len();
        let mut effects = Vec::new();
        let mut matches = Vec::new();
        let mut out = (Effect::Indeterminate, None);
        for (i, (effect, weight)) in stream.iter().enumerate() {
            effects.push(*effect);
            matches.push(*weight);
            out = effector.merge_effects(expr, &effects, &matches, i, len)?;
            if out.0 != Effect::Indeterminate {
                break;
            }
        }
        Ok(out)
    }

    #[test]
    fn allow_override_short_circuits() {
        let (effect, index) = run(
            ALLOW_OVERRIDE_EFFECT,
            &[
                (Effect::Allow, 0.0),
                (Effect::Allow, 1.0),
                (Effect::Deny, 1.0),
            ],
        )
        .unwrap();
        assert_eq!(effect, Effect::Allow);
        assert_eq!(index, Some(1));
    }

    #[test]
    fn allow_override_without_match_stays_open() {
        let (effect, index) =
            run(ALLOW_OVERRIDE_EFFECT, &[(Effect::Allow, 0.0), (Effect::Deny, 1.0)]).unwrap();
        assert_eq!(effect, Effect::Indeterminate);
        assert_eq!(index, None);
    }

    #[test]
    fn deny_override_requires_full_scan() {
        let (effect, index) = run(
            DENY_OVERRIDE_EFFECT,
            &[(Effect::Allow, 1.0), (Effect::Allow, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Allow);
        assert_eq!(index, None);

        let (effect, index) = run(
            DENY_OVERRIDE_EFFECT,
            &[(Effect::Allow, 1.0), (Effect::Deny, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Deny);
        assert_eq!(index, Some(1));
    }

    #[test]
    fn allow_and_deny_needs_an_allow_and_no_deny() {
        let (effect, index) = run(
            ALLOW_AND_DENY_EFFECT,
            &[(Effect::Indeterminate, 0.0), (Effect::Allow, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Allow);
        assert_eq!(index, Some(1));

        let (effect, _) = run(
            ALLOW_AND_DENY_EFFECT,
            &[(Effect::Allow, 1.0), (Effect::Deny, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Deny);

        let (effect, _) = run(ALLOW_AND_DENY_EFFECT, &[(Effect::Allow, 0.0)]).unwrap();
        assert_eq!(effect, Effect::Indeterminate);
    }

    #[test]
    fn priority_first_match_decides() {
        let (effect, index) = run(
            PRIORITY_EFFECT,
            &[(Effect::Allow, 1.0), (Effect::Deny, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Allow);
        assert_eq!(index, Some(0));

        // Indeterminate tuples are skipped until a definite one matches.
        let (effect, index) = run(
            PRIORITY_EFFECT,
            &[(Effect::Indeterminate, 1.0), (Effect::Deny, 1.0)],
        )
        .unwrap();
        assert_eq!(effect, Effect::Deny);
        assert_eq!(index, Some(1));
    }

    #[test]
    fn priority_defaults() {
        // With no matching tuple, `|| deny` leaves the decision open
        // (the enforcer maps that to deny) …
        let (effect, _) = run(PRIORITY_EFFECT, &[(Effect::Allow, 0.0)]).unwrap();
        assert_eq!(effect, Effect::Indeterminate);

        // … while `|| allow` resolves to allow.
        let (effect, index) = run(PRIORITY_ALLOW_EFFECT, &[(Effect::Allow, 0.0)]).unwrap();
        assert_eq!(effect, Effect::Allow);
        assert_eq!(index, None);
    }

    #[test]
    fn unsupported_effect_is_an_error() {
        let err = run("most(where (p_eft == allow))", &[(Effect::Allow, 1.0)]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEffect(_)));
    }
}
