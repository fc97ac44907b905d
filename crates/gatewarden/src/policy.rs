//! Policy-store operations on the model: tuple mutation and the two
//! ordering passes applied after every load.

use std::collections::HashMap;

use tracing::debug;

use crate::effect;
use crate::error::{Error, Result};
use crate::model::Model;

/// Separator between a domain and a subject when weighing the role
/// hierarchy of domain-scoped grouping tuples.
const DOMAIN_SEP: &str = "::";

/// Weight step between a role and the roles that inherit from it.
const HIERARCHY_STEP: i64 = 10;

impl Model {
    /// The tuples of a policy assertion, in their current stored order.
    /// Absent assertions read as empty.
    pub fn get_policy(&self, sec: &str, ptype: &str) -> Vec<Vec<String>> {
        self.get_assertion(sec, ptype)
            .map(|assertion| assertion.policy.clone())
            .unwrap_or_default()
    }

    pub fn has_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> bool {
        self.get_assertion(sec, ptype)
            .map(|assertion| assertion.policy.iter().any(|r| r == rule))
            .unwrap_or(false)
    }

    /// Append one tuple. Returns false on an exact duplicate.
    pub fn add_policy_rule(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.check_arity(sec, ptype, &rule)?;
        if self.has_policy(sec, ptype, &rule) {
            return Ok(false);
        }
        self.assertion_mut(sec, ptype)?.policy.push(rule);
        self.touch();
        Ok(true)
    }

    /// Remove one tuple. Returns false when it was not present.
    pub fn remove_policy_rule(&mut self, sec: &str, ptype: &str, rule: &[String]) -> Result<bool> {
        let assertion = self.assertion_mut(sec, ptype)?;
        let before = assertion.policy.len();
        assertion.policy.retain(|r| r != rule);
        let removed = assertion.policy.len() != before;
        if removed {
            self.touch();
        }
        Ok(removed)
    }

    /// Replace the tuples of an assertion wholesale.
    pub fn set_policy(&mut self, sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> Result<()> {
        for rule in &rules {
            self.check_arity(sec, ptype, rule)?;
        }
        self.assertion_mut(sec, ptype)?.policy = rules;
        self.touch();
        Ok(())
    }

    fn check_arity(&self, sec: &str, ptype: &str, rule: &[String]) -> Result<()> {
        let assertion = self.get_assertion(sec, ptype)?;
        if sec == "g" {
            let arity = assertion.role_arity();
            if rule.len() < arity {
                return Err(Error::PolicyArity {
                    ptype: ptype.to_string(),
                    expected: arity,
                    got: rule.len(),
                });
            }
        } else if rule.len() != assertion.tokens.len() {
            return Err(Error::PolicyArity {
                ptype: ptype.to_string(),
                expected: assertion.tokens.len(),
                got: rule.len(),
            });
        }
        Ok(())
    }

    /// Stable ascending sort by the numeric `p_priority` field of each
    /// policy assertion that declares one. Assertions without the token are
    /// left untouched, so the pass is idempotent.
    pub fn sort_policies_by_priority(&mut self) -> Result<()> {
        let ptypes: Vec<String> = self.section("p").map(|(k, _)| k.to_string()).collect();
        for ptype in ptypes {
            let assertion = self.assertion_mut("p", &ptype)?;
            let Some(idx) = assertion.priority_index else {
                continue;
            };

            let mut keyed: Vec<(i64, Vec<String>)> = Vec::with_capacity(assertion.policy.len());
            for rule in assertion.policy.drain(..) {
                let priority = rule[idx].parse::<i64>().map_err(|_| {
                    Error::InvalidModel(format!(
                        "policy `{ptype}` has non-numeric priority `{}`",
                        rule[idx]
                    ))
                })?;
                keyed.push((priority, rule));
            }
            keyed.sort_by_key(|(priority, _)| *priority);
            assertion.policy = keyed.into_iter().map(|(_, rule)| rule).collect();
        }
        Ok(())
    }

    /// Stable sort placing tuples with the most specific subject first, so
    /// a role inherited through the `g` graph is consulted after the roles
    /// that inherit from it. Runs only under the subject-priority effect.
    pub fn sort_policies_by_subject_hierarchy(&mut self) -> Result<()> {
        let Ok(effect) = self.get_assertion("e", "e") else {
            return Ok(());
        };
        if effect.value != effect::SUBJECT_PRIORITY_EFFECT {
            return Ok(());
        }

        let weights = subject_weights(&self.get_policy("g", "g"));
        let ptypes: Vec<String> = self.section("p").map(|(k, _)| k.to_string()).collect();
        for ptype in ptypes {
            let domain_index = self
                .get_assertion("p", &ptype)?
                .tokens
                .iter()
                .position(|t| t == &format!("{ptype}_dom"));

            let assertion = self.assertion_mut("p", &ptype)?;
            assertion.policy.sort_by_key(|rule| {
                let domain = domain_index.map(|i| rule[i].as_str()).unwrap_or("");
                // Deeper subjects carry larger weights; negate for
                // descending order under the ascending stable sort.
                -weights
                    .get(&name_with_domain(domain, &rule[0]))
                    .copied()
                    .unwrap_or(0)
            });
            debug!(ptype, "sorted policies by subject hierarchy");
        }
        Ok(())
    }
}

fn name_with_domain(domain: &str, name: &str) -> String {
    if domain.is_empty() {
        name.to_string()
    } else {
        format!("{domain}{DOMAIN_SEP}{name}")
    }
}

/// Weigh every subject in the grouping tuples by its depth in the
/// inheritance relation: roots weigh 0, each inheriting subject weighs one
/// step more than the role it inherits from. Cycles are cut by refusing to
/// raise a weight twice.
fn subject_weights(g_policies: &[Vec<String>]) -> HashMap<String, i64> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut has_parent: HashMap<String, bool> = HashMap::new();

    for rule in g_policies {
        if rule.len() < 2 {
            continue;
        }
        let domain = rule.get(2).map(String::as_str).unwrap_or("");
        let child = name_with_domain(domain, &rule[0]);
        let parent = name_with_domain(domain, &rule[1]);

        children.entry(parent.clone()).or_default().push(child.clone());
        has_parent.entry(parent).or_insert(false);
        *has_parent.entry(child).or_insert(true) = true;
    }

    let mut weights: HashMap<String, i64> = HashMap::new();
    let mut queue: Vec<String> = has_parent
        .iter()
        .filter(|(_, has)| !**has)
        .map(|(name, _)| name.clone())
        .collect();
    queue.sort();
    for root in &queue {
        weights.insert(root.clone(), 0);
    }

    let mut cursor = 0;
    while cursor < queue.len() {
        let current = queue[cursor].clone();
        cursor += 1;
        let weight = weights[&current];
        for child in children.get(&current).cloned().unwrap_or_default() {
            if !weights.contains_key(&child) {
                weights.insert(child.clone(), weight + HIERARCHY_STEP);
                queue.push(child);
            }
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_policy() -> Model {
        let mut model = Model::from_text(
            r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#,
        )
        .unwrap();
        model
            .add_policy_rule(
                "p",
                "p",
                vec!["alice".into(), "data1".into(), "read".into()],
            )
            .unwrap();
        model
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut model = model_with_policy();
        let rule: Vec<String> = vec!["bob".into(), "data2".into(), "write".into()];

        assert!(model.add_policy_rule("p", "p", rule.clone()).unwrap());
        assert!(model.has_policy("p", "p", &rule));
        // Exact duplicates are rejected.
        assert!(!model.add_policy_rule("p", "p", rule.clone()).unwrap());

        assert!(model.remove_policy_rule("p", "p", &rule).unwrap());
        assert!(!model.has_policy("p", "p", &rule));
        assert!(!model.remove_policy_rule("p", "p", &rule).unwrap());
    }

    #[test]
    fn arity_mismatch_rejected() {
        let mut model = model_with_policy();
        let err = model
            .add_policy_rule("p", "p", vec!["too".into(), "short".into()])
            .unwrap_err();
        assert!(matches!(err, Error::PolicyArity { expected: 3, got: 2, .. }));
    }

    #[test]
    fn set_policy_replaces_wholesale() {
        let mut model = model_with_policy();
        model
            .set_policy(
                "p",
                "p",
                vec![vec!["carol".into(), "data3".into(), "read".into()]],
            )
            .unwrap();
        assert_eq!(model.get_policy("p", "p").len(), 1);
        assert_eq!(model.get_policy("p", "p")[0][0], "carol");
    }

    #[test]
    fn priority_sort_is_stable_and_idempotent() {
        let mut model = Model::from_text(
            r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = priority, sub, obj, act

[policy_effect]
e = priority(p.eft) || deny

[matchers]
m = r.sub == p.sub
"#,
        )
        .unwrap();
        for rule in [
            ["20", "carol", "data", "read"],
            ["10", "alice", "data", "read"],
            ["10", "bob", "data", "read"],
        ] {
            model
                .add_policy_rule("p", "p", rule.iter().map(|s| s.to_string()).collect())
                .unwrap();
        }

        model.sort_policies_by_priority().unwrap();
        let once = model.get_policy("p", "p");
        // Ascending by priority, ties kept in insertion order.
        assert_eq!(once[0][1], "alice");
        assert_eq!(once[1][1], "bob");
        assert_eq!(once[2][1], "carol");

        model.sort_policies_by_priority().unwrap();
        assert_eq!(model.get_policy("p", "p"), once);
    }

    #[test]
    fn priority_sort_rejects_non_numeric() {
        let mut model = Model::from_text(
            r#"
[request_definition]
r = sub

[policy_definition]
p = priority, sub

[policy_effect]
e = priority(p.eft) || deny

[matchers]
m = r.sub == p.sub
"#,
        )
        .unwrap();
        model
            .add_policy_rule("p", "p", vec!["high".into(), "alice".into()])
            .unwrap();
        assert!(model.sort_policies_by_priority().is_err());
    }

    #[test]
    fn subject_hierarchy_sort_puts_specific_subjects_first() {
        let mut model = Model::from_text(
            r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _

[policy_effect]
e = subjectPriority(p.eft) || deny

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#,
        )
        .unwrap();
        // admin inherits from root; editor inherits from admin.
        for rule in [["admin", "root"], ["editor", "admin"]] {
            model
                .add_policy_rule("g", "g", rule.iter().map(|s| s.to_string()).collect())
                .unwrap();
        }
        for rule in [
            ["root", "data", "write", "deny"],
            ["editor", "data", "write", "allow"],
            ["admin", "data", "write", "deny"],
        ] {
            model
                .add_policy_rule("p", "p", rule.iter().map(|s| s.to_string()).collect())
                .unwrap();
        }

        model.sort_policies_by_subject_hierarchy().unwrap();
        let sorted = model.get_policy("p", "p");
        assert_eq!(sorted[0][0], "editor");
        assert_eq!(sorted[1][0], "admin");
        assert_eq!(sorted[2][0], "root");

        // Idempotent: a second pass changes nothing.
        model.sort_policies_by_subject_hierarchy().unwrap();
        assert_eq!(model.get_policy("p", "p"), sorted);
    }

    #[test]
    fn subject_hierarchy_sort_skips_other_effects() {
        let mut model = model_with_policy();
        let before = model.get_policy("p", "p");
        model.sort_policies_by_subject_hierarchy().unwrap();
        assert_eq!(model.get_policy("p", "p"), before);
    }
}
