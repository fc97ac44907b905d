use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::config;
use crate::error::{Error, Result};
use crate::role_graph::RoleGraph;
use crate::util;

/// Section kinds of the model DSL, keyed by their short prefix.
const SECTION_KINDS: &[(&str, &str)] = &[
    ("request_definition", "r"),
    ("policy_definition", "p"),
    ("role_definition", "g"),
    ("policy_effect", "e"),
    ("matchers", "m"),
];

/// Sections that every usable model must declare.
const REQUIRED_KINDS: &[&str] = &["r", "p", "e", "m"];

/// Monotonic source for model versions. Giving every model state a
/// process-unique version lets compiled-matcher caches validate entries
/// without coordinating with the model that produced them.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Direction of an incremental role-link update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOp {
    Add,
    Remove,
}

/// A named declaration inside a model section.
///
/// For request/policy definitions `tokens` holds the fully-qualified
/// attribute names (`r_sub`, `p_obj`, …) and `policy` the loaded tuples.
/// For effect and matcher sections `value` is the normalized expression
/// source; for role definitions it is the arity descriptor (`_, _`).
#[derive(Debug, Clone, Default)]
pub struct Assertion {
    pub key: String,
    pub value: String,
    pub tokens: Vec<String>,
    pub policy: Vec<Vec<String>>,
    pub(crate) priority_index: Option<usize>,
}

impl Assertion {
    /// Minimum tuple arity of a role-definition assertion, derived from the
    /// underscore count of its descriptor.
    pub(crate) fn role_arity(&self) -> usize {
        self.value.matches('_').count()
    }
}

/// The parsed access-control model: section kind → assertion key → assertion.
///
/// A model is effectively immutable for the life of a decision; the
/// enforcer swaps whole instances on reload. Every mutation advances the
/// version counter, which invalidates any compiled-matcher cache entry
/// recorded against an earlier version.
#[derive(Debug)]
pub struct Model {
    sections: BTreeMap<String, BTreeMap<String, Assertion>>,
    version: u64,
}

impl Clone for Model {
    fn clone(&self) -> Self {
        Self {
            sections: self.sections.clone(),
            version: next_version(),
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        Self {
            sections: BTreeMap::new(),
            version: next_version(),
        }
    }

    /// Parse a model from DSL text.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut model = Model::new();
        for section in config::parse(text)? {
            let kind = SECTION_KINDS
                .iter()
                .find(|(name, _)| *name == section.name)
                .map(|(_, kind)| *kind)
                .ok_or_else(|| {
                    Error::InvalidModel(format!("unknown section `[{}]`", section.name))
                })?;
            for (key, value) in section.entries {
                model.add_def(kind, &key, &value);
            }
        }

        for kind in REQUIRED_KINDS {
            if !model.sections.contains_key(*kind) {
                let name = SECTION_KINDS
                    .iter()
                    .find(|(_, k)| k == kind)
                    .map(|(n, _)| *n)
                    .unwrap_or(kind);
                return Err(Error::InvalidModel(format!("missing section `[{name}]`")));
            }
        }
        Ok(model)
    }

    /// Parse a model from a DSL file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ModelIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_text(&text)
    }

    /// Add an assertion to a section. Returns false when `value` is empty.
    ///
    /// Request/policy token lists are expanded into qualified names;
    /// effect/matcher sources are comment-stripped and reference-escaped.
    pub fn add_def(&mut self, sec: &str, key: &str, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }

        let mut assertion = Assertion {
            key: key.to_string(),
            value: value.to_string(),
            ..Assertion::default()
        };

        match sec {
            "r" | "p" => {
                assertion.tokens = value
                    .split(',')
                    .map(|token| format!("{key}_{}", token.trim()))
                    .collect();
                assertion.priority_index = assertion
                    .tokens
                    .iter()
                    .position(|t| t == &format!("{key}_priority"));
            }
            "e" | "m" => {
                assertion.value = util::remove_comments(&util::escape_assertion(value));
            }
            _ => {}
        }

        self.sections
            .entry(sec.to_string())
            .or_default()
            .insert(key.to_string(), assertion);
        true
    }

    pub fn get_assertion(&self, sec: &str, key: &str) -> Result<&Assertion> {
        self.sections
            .get(sec)
            .and_then(|assertions| assertions.get(key))
            .ok_or_else(|| Error::UnknownAssertion {
                section: sec.to_string(),
                key: key.to_string(),
            })
    }

    pub(crate) fn assertion_mut(&mut self, sec: &str, key: &str) -> Result<&mut Assertion> {
        self.sections
            .get_mut(sec)
            .and_then(|assertions| assertions.get_mut(key))
            .ok_or_else(|| Error::UnknownAssertion {
                section: sec.to_string(),
                key: key.to_string(),
            })
    }

    /// All assertions of a section kind, in key order. Empty for absent kinds.
    pub fn section<'a>(&'a self, sec: &str) -> impl Iterator<Item = (&'a str, &'a Assertion)> + 'a {
        self.sections
            .get(sec)
            .into_iter()
            .flat_map(|assertions| assertions.iter().map(|(k, a)| (k.as_str(), a)))
    }

    pub fn has_section(&self, sec: &str) -> bool {
        self.sections.contains_key(sec)
    }

    /// The model's current version. Any mutation moves it forward; no two
    /// distinct states ever share a version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn touch(&mut self) {
        self.version = next_version();
    }

    /// Drop every loaded policy tuple, keeping the schema.
    pub fn clear_policy(&mut self) {
        for sec in ["p", "g"] {
            if let Some(assertions) = self.sections.get_mut(sec) {
                for assertion in assertions.values_mut() {
                    assertion.policy.clear();
                }
            }
        }
        self.touch();
    }

    /// Rebuild every role graph from the grouping tuples currently loaded.
    pub(crate) fn build_role_links(
        &self,
        rm_map: &BTreeMap<String, Arc<RwLock<RoleGraph>>>,
    ) -> Result<()> {
        for (key, assertion) in self.section("g") {
            let Some(rm) = rm_map.get(key) else { continue };
            let arity = assertion.role_arity();
            if !(2..=3).contains(&arity) {
                return Err(Error::InvalidModel(format!(
                    "role definition `{key}` must declare 2 or 3 slots, found {arity}"
                )));
            }

            let mut graph = rm.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            for rule in &assertion.policy {
                if rule.len() < arity {
                    return Err(Error::PolicyArity {
                        ptype: key.to_string(),
                        expected: arity,
                        got: rule.len(),
                    });
                }
                let domain = (arity == 3).then(|| rule[2].as_str());
                graph.add_link(&rule[0], &rule[1], domain);
            }
            debug!(ptype = key, links = assertion.policy.len(), "built role links");
        }
        Ok(())
    }

    /// Apply a batch of grouping-tuple changes to the affected role graph
    /// without rebuilding it from scratch.
    pub(crate) fn build_incremental_role_links(
        &self,
        rm_map: &BTreeMap<String, Arc<RwLock<RoleGraph>>>,
        op: PolicyOp,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<()> {
        let assertion = self.get_assertion("g", ptype)?;
        let Some(rm) = rm_map.get(ptype) else {
            return Ok(());
        };
        let arity = assertion.role_arity();

        let mut graph = rm.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        for rule in rules {
            if rule.len() < arity {
                return Err(Error::PolicyArity {
                    ptype: ptype.to_string(),
                    expected: arity,
                    got: rule.len(),
                });
            }
            let domain = (arity == 3).then(|| rule[2].as_str());
            match op {
                PolicyOp::Add => graph.add_link(&rule[0], &rule[1], domain),
                PolicyOp::Remove => {
                    graph.delete_link(&rule[0], &rule[1], domain);
                }
            }
        }
        Ok(())
    }
}
