//! Storage adapter contract plus the file and in-memory reference
//! implementations used by tests and simple embeddings.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::util;

/// Returned by the optional adapter hooks a backend chooses not to
/// implement; callers treat it as "fall back to full saves".
#[derive(Debug, thiserror::Error)]
#[error("operation is not supported by this adapter")]
pub struct NotImplemented;

/// A policy storage backend.
///
/// `load_policy`/`save_policy` are mandatory; the filtered flavor and the
/// per-rule mutation hooks are optional and default to [`NotImplemented`].
/// Implementations use interior mutability where they carry state, since
/// the enforcer shares them behind `&self`.
pub trait Adapter: Send + Sync {
    /// Populate the model's policy tuples from storage.
    fn load_policy(&self, model: &mut Model) -> anyhow::Result<()>;

    /// Persist all tuples. The enforcer refuses to call this while a
    /// filtered policy is loaded.
    fn save_policy(&self, model: &Model) -> anyhow::Result<()>;

    /// Populate only the tuples matching `filter`.
    fn load_filtered_policy(&self, model: &mut Model, filter: &Filter) -> anyhow::Result<()> {
        let _ = (model, filter);
        Err(NotImplemented.into())
    }

    /// Whether the currently loaded policy is a filtered subset.
    fn is_filtered(&self) -> bool {
        false
    }

    fn add_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> anyhow::Result<()> {
        let _ = (sec, ptype, rule);
        Err(NotImplemented.into())
    }

    fn remove_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> anyhow::Result<()> {
        let _ = (sec, ptype, rule);
        Err(NotImplemented.into())
    }

    fn add_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> anyhow::Result<()> {
        let _ = (sec, ptype, rules);
        Err(NotImplemented.into())
    }

    fn remove_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> anyhow::Result<()> {
        let _ = (sec, ptype, rules);
        Err(NotImplemented.into())
    }
}

/// Field filter for partial policy loads. Each list constrains the
/// corresponding tuple fields of `p`-family / `g`-family lines; empty
/// strings match anything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub p: Vec<String>,
    pub g: Vec<String>,
}

impl Filter {
    fn matches(&self, ptype: &str, rule: &[String]) -> bool {
        let wanted = match ptype.chars().next() {
            Some('p') => &self.p,
            Some('g') => &self.g,
            _ => return true,
        };
        wanted
            .iter()
            .zip(rule.iter())
            .all(|(want, field)| want.is_empty() || want == field)
    }
}

/// Parse one `ptype, field, field…` line into the model. Blank lines and
/// `#` comments are skipped; arity mismatches are rejected.
pub fn load_policy_line(line: &str, model: &mut Model) -> Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }

    let mut fields = util::split_csv_line(line);
    if fields.iter().all(|f| f.is_empty()) {
        return Ok(());
    }
    let ptype = fields.remove(0);
    let sec = match ptype.chars().next() {
        Some('p') => "p",
        Some('g') => "g",
        _ => {
            return Err(Error::InvalidModel(format!(
                "policy line has unknown type `{ptype}`"
            )))
        }
    };

    let assertion = model.get_assertion(sec, &ptype)?;
    if sec == "g" {
        let arity = assertion.role_arity();
        if fields.len() < arity {
            return Err(Error::PolicyArity {
                ptype,
                expected: arity,
                got: fields.len(),
            });
        }
    } else if fields.len() != assertion.tokens.len() {
        return Err(Error::PolicyArity {
            ptype,
            expected: assertion.tokens.len(),
            got: fields.len(),
        });
    }

    model.assertion_mut(sec, &ptype)?.policy.push(fields);
    Ok(())
}

fn policy_lines(model: &Model) -> Vec<String> {
    let mut lines = Vec::new();
    for sec in ["p", "g"] {
        for (ptype, assertion) in model.section(sec) {
            for rule in &assertion.policy {
                lines.push(format!("{ptype}, {}", rule.join(", ")));
            }
        }
    }
    lines
}

/// CSV-line adapter over a single policy file.
#[derive(Debug)]
pub struct FileAdapter {
    path: PathBuf,
    filtered: AtomicBool,
}

impl FileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filtered: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_lines(&self, model: &mut Model, filter: Option<&Filter>) -> anyhow::Result<()> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read policy file: {}", self.path.display()))?;

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(filter) = filter {
                let mut fields = util::split_csv_line(trimmed);
                let ptype = fields.remove(0);
                if !filter.matches(&ptype, &fields) {
                    continue;
                }
            }
            load_policy_line(trimmed, model)
                .with_context(|| format!("failed to load policy line: {trimmed}"))?;
        }
        Ok(())
    }
}

impl Adapter for FileAdapter {
    fn load_policy(&self, model: &mut Model) -> anyhow::Result<()> {
        self.filtered.store(false, Ordering::Release);
        self.load_lines(model, None)
    }

    fn save_policy(&self, model: &Model) -> anyhow::Result<()> {
        let mut contents = policy_lines(model).join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write policy file: {}", self.path.display()))
    }

    fn load_filtered_policy(&self, model: &mut Model, filter: &Filter) -> anyhow::Result<()> {
        self.load_lines(model, Some(filter))?;
        self.filtered.store(true, Ordering::Release);
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::Acquire)
    }
}

/// In-memory adapter holding `(ptype, rule)` pairs in insertion order.
/// Implements every mutation hook, which makes it the reference backend
/// for exercising `auto_save`.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    rules: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn rules(&self) -> MutexGuard<'_, Vec<(String, Vec<String>)>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed the store from `ptype, field…` lines (test convenience).
    pub fn from_lines(lines: &str) -> Self {
        let adapter = Self::new();
        {
            let mut rules = adapter.rules();
            for line in lines.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut fields = util::split_csv_line(line);
                let ptype = fields.remove(0);
                rules.push((ptype, fields));
            }
        }
        adapter
    }

    pub fn len(&self) -> usize {
        self.rules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Adapter for MemoryAdapter {
    fn load_policy(&self, model: &mut Model) -> anyhow::Result<()> {
        let rules = self.rules();
        for (ptype, fields) in rules.iter() {
            let line = format!("{ptype}, {}", fields.join(", "));
            load_policy_line(&line, model)?;
        }
        Ok(())
    }

    fn save_policy(&self, model: &Model) -> anyhow::Result<()> {
        let mut rules = self.rules();
        rules.clear();
        for sec in ["p", "g"] {
            for (ptype, assertion) in model.section(sec) {
                for rule in &assertion.policy {
                    rules.push((ptype.to_string(), rule.clone()));
                }
            }
        }
        Ok(())
    }

    fn add_policy(&self, _sec: &str, ptype: &str, rule: &[String]) -> anyhow::Result<()> {
        self.rules().push((ptype.to_string(), rule.to_vec()));
        Ok(())
    }

    fn remove_policy(&self, _sec: &str, ptype: &str, rule: &[String]) -> anyhow::Result<()> {
        self.rules().retain(|(t, r)| !(t == ptype && r == rule));
        Ok(())
    }

    fn add_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> anyhow::Result<()> {
        for rule in rules {
            self.add_policy(sec, ptype, rule)?;
        }
        Ok(())
    }

    fn remove_policies(&self, sec: &str, ptype: &str, rules: &[Vec<String>]) -> anyhow::Result<()> {
        for rule in rules {
            self.remove_policy(sec, ptype, rule)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

    fn temp_policy_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gatewarden-adapter-{}-{:?}.csv",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_policy_line_appends_tuples() {
        let mut model = Model::from_text(MODEL).unwrap();
        load_policy_line("p, alice, data1, read", &mut model).unwrap();
        load_policy_line("g, alice, admin", &mut model).unwrap();
        load_policy_line("# comment", &mut model).unwrap();
        load_policy_line("", &mut model).unwrap();

        assert_eq!(model.get_policy("p", "p"), vec![vec!["alice", "data1", "read"]]);
        assert_eq!(model.get_policy("g", "g"), vec![vec!["alice", "admin"]]);
    }

    #[test]
    fn arity_mismatch_rejected_at_load() {
        let mut model = Model::from_text(MODEL).unwrap();
        let err = load_policy_line("p, alice, data1", &mut model).unwrap_err();
        assert!(matches!(err, Error::PolicyArity { expected: 3, got: 2, .. }));
    }

    #[test]
    fn unknown_ptype_rejected() {
        let mut model = Model::from_text(MODEL).unwrap();
        assert!(load_policy_line("q, alice", &mut model).is_err());
        assert!(matches!(
            load_policy_line("p9, alice, data1, read", &mut model).unwrap_err(),
            Error::UnknownAssertion { .. }
        ));
    }

    #[test]
    fn file_adapter_round_trip() {
        let path = temp_policy_file("p, alice, data1, read\ng, alice, admin\n");
        let adapter = FileAdapter::new(&path);

        let mut model = Model::from_text(MODEL).unwrap();
        adapter.load_policy(&mut model).unwrap();
        assert_eq!(model.get_policy("p", "p").len(), 1);
        assert_eq!(model.get_policy("g", "g").len(), 1);

        model
            .add_policy_rule("p", "p", vec!["bob".into(), "data2".into(), "write".into()])
            .unwrap();
        adapter.save_policy(&model).unwrap();

        let mut reloaded = Model::from_text(MODEL).unwrap();
        adapter.load_policy(&mut reloaded).unwrap();
        assert_eq!(reloaded.get_policy("p", "p").len(), 2);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn file_adapter_filtered_load() {
        let path = temp_policy_file(
            "p, alice, data1, read\np, bob, data2, write\ng, alice, admin\n",
        );
        let adapter = FileAdapter::new(&path);
        assert!(!adapter.is_filtered());

        let mut model = Model::from_text(MODEL).unwrap();
        let filter = Filter {
            p: vec!["alice".into()],
            g: vec![],
        };
        adapter.load_filtered_policy(&mut model, &filter).unwrap();

        assert!(adapter.is_filtered());
        assert_eq!(model.get_policy("p", "p"), vec![vec!["alice", "data1", "read"]]);
        // Unconstrained g lines load in full.
        assert_eq!(model.get_policy("g", "g").len(), 1);

        // A full reload clears the filtered flag.
        let mut model = Model::from_text(MODEL).unwrap();
        adapter.load_policy(&mut model).unwrap();
        assert!(!adapter.is_filtered());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn memory_adapter_mutation_hooks() {
        let adapter = MemoryAdapter::from_lines("p, alice, data1, read");
        adapter
            .add_policy("p", "p", &["bob".into(), "data2".into(), "write".into()])
            .unwrap();
        assert_eq!(adapter.len(), 2);

        adapter
            .remove_policy("p", "p", &["alice".into(), "data1".into(), "read".into()])
            .unwrap();
        assert_eq!(adapter.len(), 1);

        let mut model = Model::from_text(MODEL).unwrap();
        adapter.load_policy(&mut model).unwrap();
        assert_eq!(model.get_policy("p", "p"), vec![vec!["bob", "data2", "write"]]);
    }

    #[test]
    fn default_hooks_report_not_implemented() {
        struct LoadOnly;
        impl Adapter for LoadOnly {
            fn load_policy(&self, _model: &mut Model) -> anyhow::Result<()> {
                Ok(())
            }
            fn save_policy(&self, _model: &Model) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let err = LoadOnly.add_policy("p", "p", &[]).unwrap_err();
        assert!(err.downcast_ref::<NotImplemented>().is_some());
    }
}
