use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::adapter::{Adapter, FileAdapter, Filter, NotImplemented};
use crate::builtins::{ExprFn, FunctionTable};
use crate::effect::{DefaultEffector, Effect, Effector};
use crate::error::{Error, Result};
use crate::expr::{self, CompiledMatcher, EvalScope, MatcherCache, VarResolver};
use crate::model::{Model, PolicyOp};
use crate::role_graph::{MatchingFn, RoleGraph, DEFAULT_MAX_DEPTH};
use crate::util;
use crate::value::{EnforceArgs, Value};
use crate::watcher::{Dispatcher, Watcher};

/// Selects which named assertions a decision evaluates against when the
/// model declares more than one (`r2`, `p2`, `e2`, `m2`, …).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceContext {
    pub rtype: String,
    pub ptype: String,
    pub etype: String,
    pub mtype: String,
}

impl EnforceContext {
    /// Build a context from a key suffix: `new("2")` selects `r2`/`p2`/`e2`/`m2`.
    /// Individual fields can be overridden afterwards.
    pub fn new(suffix: &str) -> Self {
        Self {
            rtype: format!("r{suffix}"),
            ptype: format!("p{suffix}"),
            etype: format!("e{suffix}"),
            mtype: format!("m{suffix}"),
        }
    }
}

impl Default for EnforceContext {
    fn default() -> Self {
        Self::new("")
    }
}

/// Everything a decision needs to observe atomically. Decisions hold the
/// read half of the surrounding lock end-to-end, so reload and mutation
/// never produce a torn view.
struct EnforcerState {
    model: Model,
    adapter: Option<Box<dyn Adapter>>,
    rm_map: BTreeMap<String, Arc<RwLock<RoleGraph>>>,
    functions: FunctionTable,
    effector: Box<dyn Effector>,
    enabled: bool,
    auto_save: bool,
    auto_build_role_links: bool,
    auto_notify_watcher: bool,
    auto_notify_dispatcher: bool,
    accept_json_request: bool,
}

/// The authorization decision pipeline.
///
/// An enforcer owns a model, its policy tuples, one role graph per
/// role-definition assertion, and a compiled-matcher cache. It is safe to
/// share behind an `Arc` and run decisions from many threads; mutations
/// (policy changes, reloads) serialize against in-flight decisions through
/// a readers-shared / writer-exclusive lock.
pub struct Enforcer {
    state: RwLock<EnforcerState>,
    cache: RwLock<MatcherCache>,
    watcher: Mutex<Option<Box<dyn Watcher>>>,
    dispatcher: Mutex<Option<Box<dyn Dispatcher>>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn role_graphs_for(model: &Model) -> BTreeMap<String, Arc<RwLock<RoleGraph>>> {
    model
        .section("g")
        .map(|(key, _)| {
            (
                key.to_string(),
                Arc::new(RwLock::new(RoleGraph::new(DEFAULT_MAX_DEPTH))),
            )
        })
        .collect()
}

/// Wrap a role graph's reachability query as a matcher-callable function.
fn role_graph_fn(name: &str, rm: Arc<RwLock<RoleGraph>>) -> ExprFn {
    let name = name.to_string();
    Arc::new(move |args: &[Value]| {
        if !(2..=3).contains(&args.len()) {
            return Err(Error::Eval(format!(
                "{name}() expects 2 or 3 arguments, got {}",
                args.len()
            )));
        }
        let as_str = |v: &Value| -> Result<String> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Eval(format!("{name}() expects string arguments")))
        };
        let name1 = as_str(&args[0])?;
        let name2 = as_str(&args[1])?;
        let domain = args.get(2).map(as_str).transpose()?;

        let graph = read_lock(&rm);
        Ok(Value::Bool(graph.has_link(
            &name1,
            &name2,
            domain.as_deref(),
        )))
    })
}

/// Normalize a matcher result to a match weight: booleans and numbers
/// count, anything else is a type error.
fn match_weight(value: Value) -> Result<f64> {
    match value {
        Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::Int(n) => Ok(if n != 0 { 1.0 } else { 0.0 }),
        Value::Float(f) => Ok(if f != 0.0 { 1.0 } else { 0.0 }),
        other => Err(Error::MatcherResult {
            got: other.type_name(),
        }),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Positional variable resolver over the current (request, tuple) pair.
struct TupleScope<'a> {
    r_key: &'a str,
    p_key: &'a str,
    r_tokens: &'a HashMap<String, usize>,
    r_vals: &'a [Value],
    p_tokens: &'a HashMap<String, usize>,
    p_vals: &'a [String],
}

impl VarResolver for TupleScope<'_> {
    fn resolve(&self, name: &str) -> Result<Value> {
        if let Some(&i) = self.p_tokens.get(name) {
            return Ok(Value::Str(self.p_vals[i].clone()));
        }
        if let Some(&i) = self.r_tokens.get(name) {
            return Ok(self.r_vals[i].clone());
        }
        // Sub-expressions stored in policy data may name the default
        // section keys (`r.sub`) while the request selected a numbered
        // variant (`r2`); retry under the active keys.
        if let Some(rest) = name.strip_prefix("r_") {
            if let Some(&i) = self.r_tokens.get(&format!("{}_{rest}", self.r_key)) {
                return Ok(self.r_vals[i].clone());
            }
        }
        if let Some(rest) = name.strip_prefix("p_") {
            if let Some(&i) = self.p_tokens.get(&format!("{}_{rest}", self.p_key)) {
                return Ok(Value::Str(self.p_vals[i].clone()));
            }
        }
        Err(Error::Eval(format!("unknown parameter `{name}`")))
    }
}

impl Enforcer {
    /// Create an enforcer over a model with no storage backend. Policy
    /// tuples are managed through the mutation API.
    pub fn new(model: Model) -> Result<Self> {
        Self::build(model, None)
    }

    /// Create an enforcer and load the policy from `adapter` (unless the
    /// adapter reports an already-filtered view).
    pub fn with_adapter(model: Model, adapter: impl Adapter + 'static) -> Result<Self> {
        Self::build(model, Some(Box::new(adapter)))
    }

    /// Create an enforcer from a model file and a CSV policy file.
    pub fn from_files(
        model_path: impl AsRef<std::path::Path>,
        policy_path: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        let model = Model::from_file(model_path)?;
        Self::with_adapter(model, FileAdapter::new(policy_path))
    }

    fn build(model: Model, adapter: Option<Box<dyn Adapter>>) -> Result<Self> {
        let rm_map = role_graphs_for(&model);
        let load_from_adapter = adapter
            .as_ref()
            .is_some_and(|adapter| !adapter.is_filtered());

        let enforcer = Self {
            state: RwLock::new(EnforcerState {
                model,
                adapter,
                rm_map,
                functions: FunctionTable::with_builtins(),
                effector: Box::new(DefaultEffector),
                enabled: true,
                auto_save: true,
                auto_build_role_links: true,
                auto_notify_watcher: true,
                auto_notify_dispatcher: true,
                accept_json_request: false,
            }),
            cache: RwLock::new(MatcherCache::default()),
            watcher: Mutex::new(None),
            dispatcher: Mutex::new(None),
        };

        if load_from_adapter {
            enforcer.load_policy()?;
        } else {
            enforcer.build_role_links()?;
        }
        Ok(enforcer)
    }

    fn state_read(&self) -> RwLockReadGuard<'_, EnforcerState> {
        read_lock(&self.state)
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, EnforcerState> {
        write_lock(&self.state)
    }

    // ── Enforce entry points ────────────────────────────────────────────

    /// Decide whether the request is permitted under the default sections.
    pub fn enforce<A: EnforceArgs>(&self, args: A) -> Result<bool> {
        let rvals = args.into_vals();
        self.protected_enforce(None, None, &rvals, None)
    }

    /// Decide under the sections selected by `ctx`.
    pub fn enforce_with_context<A: EnforceArgs>(
        &self,
        ctx: &EnforceContext,
        args: A,
    ) -> Result<bool> {
        let rvals = args.into_vals();
        self.protected_enforce(Some(ctx), None, &rvals, None)
    }

    /// Decide with a one-off matcher source instead of the model's.
    pub fn enforce_with_matcher<A: EnforceArgs>(&self, matcher: &str, args: A) -> Result<bool> {
        let rvals = args.into_vals();
        self.protected_enforce(None, Some(matcher), &rvals, None)
    }

    /// Decide and report the policy tuple that settled the outcome
    /// (empty when no tuple did).
    pub fn enforce_ex<A: EnforceArgs>(&self, args: A) -> Result<(bool, Vec<String>)> {
        let rvals = args.into_vals();
        let mut explain = Vec::new();
        let allowed = self.protected_enforce(None, None, &rvals, Some(&mut explain))?;
        Ok((allowed, explain))
    }

    pub fn enforce_ex_with_context<A: EnforceArgs>(
        &self,
        ctx: &EnforceContext,
        args: A,
    ) -> Result<(bool, Vec<String>)> {
        let rvals = args.into_vals();
        let mut explain = Vec::new();
        let allowed = self.protected_enforce(Some(ctx), None, &rvals, Some(&mut explain))?;
        Ok((allowed, explain))
    }

    pub fn enforce_ex_with_matcher<A: EnforceArgs>(
        &self,
        matcher: &str,
        args: A,
    ) -> Result<(bool, Vec<String>)> {
        let rvals = args.into_vals();
        let mut explain = Vec::new();
        let allowed = self.protected_enforce(None, Some(matcher), &rvals, Some(&mut explain))?;
        Ok((allowed, explain))
    }

    /// Decide a batch of requests, failing fast on the first error.
    pub fn batch_enforce(&self, requests: Vec<Vec<Value>>) -> Result<Vec<bool>> {
        requests
            .into_iter()
            .map(|rvals| self.protected_enforce(None, None, &rvals, None))
            .collect()
    }

    pub fn batch_enforce_with_matcher(
        &self,
        matcher: &str,
        requests: Vec<Vec<Value>>,
    ) -> Result<Vec<bool>> {
        requests
            .into_iter()
            .map(|rvals| self.protected_enforce(None, Some(matcher), &rvals, None))
            .collect()
    }

    /// Catch panics from user functions at the decision boundary so a
    /// faulting extension fails one decision, not the enforcer.
    fn protected_enforce(
        &self,
        ctx: Option<&EnforceContext>,
        matcher: Option<&str>,
        rvals: &[Value],
        explain: Option<&mut Vec<String>>,
    ) -> Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| {
            self.enforce_core(ctx, matcher, rvals, explain)
        })) {
            Ok(result) => result,
            Err(payload) => Err(Error::EvaluationFault(panic_message(payload))),
        }
    }

    fn enforce_core(
        &self,
        ctx: Option<&EnforceContext>,
        custom_matcher: Option<&str>,
        rvals: &[Value],
        explain: Option<&mut Vec<String>>,
    ) -> Result<bool> {
        let state = self.state_read();
        if !state.enabled {
            debug!(request = ?rvals, "enforcement disabled; allowing by contract");
            return Ok(true);
        }

        let default_ctx = EnforceContext::default();
        let ctx = ctx.unwrap_or(&default_ctx);

        let r_ast = state.model.get_assertion("r", &ctx.rtype)?;
        let p_ast = state.model.get_assertion("p", &ctx.ptype)?;
        let e_ast = state.model.get_assertion("e", &ctx.etype)?;

        let mut exp_string = match custom_matcher {
            Some(source) => util::remove_comments(&util::escape_assertion(source)),
            None => state.model.get_assertion("m", &ctx.mtype)?.value.clone(),
        };
        if exp_string.is_empty() {
            return Err(Error::Compile {
                source_text: String::new(),
                reason: "empty matcher".to_string(),
            });
        }

        let r_tokens: HashMap<String, usize> = r_ast
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        let p_tokens: HashMap<String, usize> = p_ast
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        if state.accept_json_request {
            exp_string = util::request_json_replace(&exp_string, &r_tokens, rvals);
        }

        let has_eval = util::has_eval(&exp_string);
        let matcher = self.compile_or_fetch(&exp_string, state.model.version(), has_eval)?;

        if r_ast.tokens.len() != rvals.len() {
            return Err(Error::RequestArity {
                expected: r_ast.tokens.len(),
                got: rvals.len(),
            });
        }

        // Per-request function table: built-ins ∪ user functions ∪ one
        // function per role-definition assertion bound to its graph.
        let mut functions = state.functions.clone();
        for (ptype, rm) in &state.rm_map {
            functions.register_role_fn(ptype, role_graph_fn(ptype, rm.clone()));
        }

        let effect_expr = e_ast.value.as_str();
        let eft_token = format!("{}_eft", ctx.ptype);
        let mut effects: Vec<Effect> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut final_effect = Effect::Indeterminate;
        let mut explain_index: Option<usize> = None;

        let policy = &p_ast.policy;
        if !policy.is_empty() && exp_string.contains(&format!("{}_", ctx.ptype)) {
            for (index, pvals) in policy.iter().enumerate() {
                if pvals.len() != p_ast.tokens.len() {
                    return Err(Error::PolicyArity {
                        ptype: ctx.ptype.clone(),
                        expected: p_ast.tokens.len(),
                        got: pvals.len(),
                    });
                }

                // In JSON-request mode policy fields may also reference
                // request attributes; substitute before resolving.
                let substituted: Vec<String>;
                let effective: &[String] = if state.accept_json_request {
                    substituted = pvals
                        .iter()
                        .map(|field| {
                            util::request_json_replace(
                                &util::escape_assertion(field),
                                &r_tokens,
                                rvals,
                            )
                        })
                        .collect();
                    &substituted
                } else {
                    pvals
                };

                let resolver = TupleScope {
                    r_key: &ctx.rtype,
                    p_key: &ctx.ptype,
                    r_tokens: &r_tokens,
                    r_vals: rvals,
                    p_tokens: &p_tokens,
                    p_vals: effective,
                };
                let scope = EvalScope {
                    resolver: &resolver,
                    functions: &functions,
                };
                let weight = match_weight(matcher.eval(&scope)?)?;

                let effect = match p_tokens.get(&eft_token) {
                    Some(&i) => match effective[i].as_str() {
                        "allow" => Effect::Allow,
                        "deny" => Effect::Deny,
                        _ => Effect::Indeterminate,
                    },
                    None => Effect::Allow,
                };
                effects.push(effect);
                weights.push(weight);

                let (merged, index_hit) = state.effector.merge_effects(
                    effect_expr,
                    &effects,
                    &weights,
                    index,
                    policy.len(),
                )?;
                final_effect = merged;
                explain_index = index_hit;
                if final_effect != Effect::Indeterminate {
                    break;
                }
            }
        } else {
            if has_eval && policy.is_empty() {
                return Err(Error::EvalWithoutPolicy);
            }

            let empty: Vec<String> = vec![String::new(); p_ast.tokens.len()];
            let resolver = TupleScope {
                r_key: &ctx.rtype,
                p_key: &ctx.ptype,
                r_tokens: &r_tokens,
                r_vals: rvals,
                p_tokens: &p_tokens,
                p_vals: &empty,
            };
            let scope = EvalScope {
                resolver: &resolver,
                functions: &functions,
            };
            let matched = match matcher.eval(&scope)? {
                Value::Bool(b) => b,
                other => {
                    return Err(Error::MatcherResult {
                        got: other.type_name(),
                    })
                }
            };

            effects.push(if matched {
                Effect::Allow
            } else {
                Effect::Indeterminate
            });
            weights.push(1.0);
            let (merged, index_hit) =
                state
                    .effector
                    .merge_effects(effect_expr, &effects, &weights, 0, 1)?;
            final_effect = merged;
            explain_index = index_hit;
        }

        if let (Some(out), Some(index)) = (explain, explain_index) {
            if let Some(rule) = policy.get(index) {
                *out = rule.clone();
            }
        }

        let allowed = final_effect == Effect::Allow;
        debug!(matcher = %exp_string, request = ?rvals, allowed, "enforcement decision");
        Ok(allowed)
    }

    fn compile_or_fetch(
        &self,
        source: &str,
        model_version: u64,
        has_eval: bool,
    ) -> Result<Arc<CompiledMatcher>> {
        // eval() expands policy-supplied sub-expressions, so per-source
        // memoization would be unsound.
        if has_eval {
            return Ok(Arc::new(expr::compile(source)?));
        }
        if let Some(hit) = read_lock(&self.cache).get(model_version, source) {
            return Ok(hit);
        }
        let compiled = Arc::new(expr::compile(source)?);
        Ok(write_lock(&self.cache).insert(model_version, compiled))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Reload the policy from the adapter. The new model is built on the
    /// side and installed only on success, so a failed load leaves the
    /// previous policy intact. In-flight decisions finish against the
    /// snapshot they started with.
    pub fn load_policy(&self) -> Result<()> {
        let mut state = self.state_write();
        let mut new_model = state.model.clone();
        new_model.clear_policy();

        if let Some(adapter) = &state.adapter {
            adapter.load_policy(&mut new_model).map_err(Error::Storage)?;
        }
        self.finish_load(&mut state, new_model)
    }

    /// Load only the tuples matching `filter`. Saving is refused until a
    /// full reload replaces the filtered view.
    pub fn load_filtered_policy(&self, filter: &Filter) -> Result<()> {
        let mut state = self.state_write();
        let mut new_model = state.model.clone();
        new_model.clear_policy();

        let adapter = state
            .adapter
            .as_ref()
            .ok_or_else(|| Error::Storage(anyhow::anyhow!("no adapter configured")))?;
        adapter
            .load_filtered_policy(&mut new_model, filter)
            .map_err(Error::Storage)?;
        self.finish_load(&mut state, new_model)
    }

    fn finish_load(&self, state: &mut EnforcerState, mut new_model: Model) -> Result<()> {
        new_model.sort_policies_by_subject_hierarchy()?;
        new_model.sort_policies_by_priority()?;

        if state.auto_build_role_links {
            for rm in state.rm_map.values() {
                write_lock(rm).clear();
            }
            if let Err(error) = new_model.build_role_links(&state.rm_map) {
                // Restore links from the still-installed model.
                for rm in state.rm_map.values() {
                    write_lock(rm).clear();
                }
                let _ = state.model.build_role_links(&state.rm_map);
                return Err(error);
            }
        }
        state.model = new_model;
        debug!(version = state.model.version(), "policy loaded");
        Ok(())
    }

    /// Whether the loaded policy is a filtered subset.
    pub fn is_filtered(&self) -> bool {
        self.state_read()
            .adapter
            .as_ref()
            .is_some_and(|adapter| adapter.is_filtered())
    }

    /// Persist the current policy through the adapter, then notify the
    /// watcher when auto-notify is enabled.
    pub fn save_policy(&self) -> Result<()> {
        let notify;
        {
            let state = self.state_read();
            let adapter = state
                .adapter
                .as_ref()
                .ok_or_else(|| Error::Storage(anyhow::anyhow!("no adapter configured")))?;
            if adapter.is_filtered() {
                return Err(Error::SaveFiltered);
            }
            adapter.save_policy(&state.model).map_err(Error::Storage)?;
            notify = state.auto_notify_watcher;
        }
        if notify {
            self.notify_watcher()?;
        }
        Ok(())
    }

    /// Drop every policy tuple (or hand the clear to the dispatcher when
    /// one is installed and auto-notify is enabled).
    pub fn clear_policy(&self) -> Result<()> {
        if self.state_read().auto_notify_dispatcher {
            let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(dispatcher) = dispatcher.as_mut() {
                return dispatcher.clear_policy().map_err(Error::Dispatcher);
            }
        }
        self.state_write().model.clear_policy();
        Ok(())
    }

    /// Replace the model. Role graphs are rebuilt to match its
    /// role-definition assertions; call `load_policy` to refill tuples.
    pub fn set_model(&self, model: Model) -> Result<()> {
        let mut state = self.state_write();
        state.rm_map = role_graphs_for(&model);
        state.model = model;
        state.model.build_role_links(&state.rm_map)
    }

    pub fn set_adapter(&self, adapter: impl Adapter + 'static) {
        self.state_write().adapter = Some(Box::new(adapter));
    }

    /// Replace the effect aggregator.
    pub fn set_effector(&self, effector: impl Effector + 'static) {
        self.state_write().effector = Box::new(effector);
    }

    /// Install a watcher. Its update callback defaults to reloading the
    /// policy on peer notifications, which needs a handle back to this
    /// enforcer — hence the `Arc` receiver.
    pub fn set_watcher(self: &Arc<Self>, mut watcher: Box<dyn Watcher>) -> Result<()> {
        let weak = Arc::downgrade(self);
        watcher
            .set_update_callback(Box::new(move || {
                if let Some(enforcer) = weak.upgrade() {
                    if let Err(error) = enforcer.load_policy() {
                        warn!(%error, "policy reload after watcher notification failed");
                    }
                }
            }))
            .map_err(Error::Watcher)?;
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    pub fn set_dispatcher(&self, dispatcher: impl Dispatcher + 'static) {
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(dispatcher));
    }

    fn notify_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watcher) = watcher.as_mut() {
            watcher.update().map_err(Error::Watcher)?;
        }
        Ok(())
    }

    // ── Role graphs ─────────────────────────────────────────────────────

    /// The role graph of the default `g` assertion.
    pub fn get_role_manager(&self) -> Option<Arc<RwLock<RoleGraph>>> {
        self.get_named_role_manager("g")
    }

    pub fn get_named_role_manager(&self, ptype: &str) -> Option<Arc<RwLock<RoleGraph>>> {
        self.state_read().rm_map.get(ptype).cloned()
    }

    pub fn set_role_manager(&self, rm: Arc<RwLock<RoleGraph>>) {
        self.set_named_role_manager("g", rm);
    }

    /// Swap the role graph behind `ptype`; compiled matchers are
    /// invalidated since their `g` functions now answer differently.
    pub fn set_named_role_manager(&self, ptype: &str, rm: Arc<RwLock<RoleGraph>>) {
        let mut state = self.state_write();
        state.rm_map.insert(ptype.to_string(), rm);
        state.model.touch();
    }

    /// Attach a role-name pattern predicate to the `ptype` role graph.
    pub fn add_named_matching_fn(&self, ptype: &str, label: &str, f: MatchingFn) -> bool {
        let state = self.state_write();
        match state.rm_map.get(ptype) {
            Some(rm) => {
                write_lock(rm).add_matching_fn(label, f);
                true
            }
            None => false,
        }
    }

    /// Attach a domain pattern predicate to the `ptype` role graph.
    pub fn add_named_domain_matching_fn(&self, ptype: &str, label: &str, f: MatchingFn) -> bool {
        let state = self.state_write();
        match state.rm_map.get(ptype) {
            Some(rm) => {
                write_lock(rm).add_domain_matching_fn(label, f);
                true
            }
            None => false,
        }
    }

    /// Rebuild every role graph from the loaded grouping tuples.
    pub fn build_role_links(&self) -> Result<()> {
        let state = self.state_write();
        for rm in state.rm_map.values() {
            write_lock(rm).clear();
        }
        state.model.build_role_links(&state.rm_map)
    }

    /// Apply a batch of grouping-tuple link changes without a full rebuild.
    pub fn build_incremental_role_links(
        &self,
        op: PolicyOp,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<()> {
        let mut state = self.state_write();
        state
            .model
            .build_incremental_role_links(&state.rm_map, op, ptype, rules)?;
        state.model.touch();
        Ok(())
    }

    /// Register a user function for matcher expressions. Auto-injected
    /// role-graph functions still take precedence over the same name.
    pub fn add_function(&self, name: &str, f: ExprFn) {
        self.state_write().functions.register(name, f);
    }

    // ── Configuration toggles ───────────────────────────────────────────

    /// When disabled, every decision returns `true` without evaluation.
    pub fn enable_enforce(&self, enabled: bool) {
        self.state_write().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state_read().enabled
    }

    /// Mirror mutations into the adapter's per-rule hooks.
    pub fn enable_auto_save(&self, auto_save: bool) {
        self.state_write().auto_save = auto_save;
    }

    /// Rebuild role links when grouping tuples change.
    pub fn enable_auto_build_role_links(&self, auto: bool) {
        self.state_write().auto_build_role_links = auto;
    }

    /// Notify the watcher after successful mutations and saves.
    pub fn enable_auto_notify_watcher(&self, auto: bool) {
        self.state_write().auto_notify_watcher = auto;
    }

    /// Route mutations through the dispatcher when one is installed.
    pub fn enable_auto_notify_dispatcher(&self, auto: bool) {
        self.state_write().auto_notify_dispatcher = auto;
    }

    /// Rewrite `r_xxx.path` attribute references against JSON request
    /// values before matcher compilation.
    pub fn enable_accept_json_request(&self, accept: bool) {
        self.state_write().accept_json_request = accept;
    }

    // ── Minimal mutation surface ────────────────────────────────────────

    pub fn get_policy(&self) -> Vec<Vec<String>> {
        self.get_named_policy("p")
    }

    pub fn get_named_policy(&self, ptype: &str) -> Vec<Vec<String>> {
        self.state_read().model.get_policy("p", ptype)
    }

    pub fn get_grouping_policy(&self) -> Vec<Vec<String>> {
        self.state_read().model.get_policy("g", "g")
    }

    pub fn has_policy(&self, rule: &[String]) -> bool {
        self.state_read().model.has_policy("p", "p", rule)
    }

    /// Add one `p` tuple. Returns false on an exact duplicate.
    pub fn add_policy(&self, rule: Vec<String>) -> Result<bool> {
        self.add_named_policy("p", rule)
    }

    pub fn add_named_policy(&self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.add_policy_internal("p", ptype, rule)
    }

    pub fn remove_policy(&self, rule: Vec<String>) -> Result<bool> {
        self.remove_named_policy("p", rule)
    }

    pub fn remove_named_policy(&self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.remove_policy_internal("p", ptype, rule)
    }

    /// Add one grouping tuple and, when auto-build is on, the matching
    /// role-graph link.
    pub fn add_grouping_policy(&self, rule: Vec<String>) -> Result<bool> {
        self.add_named_grouping_policy("g", rule)
    }

    pub fn add_named_grouping_policy(&self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.add_policy_internal("g", ptype, rule)
    }

    pub fn remove_grouping_policy(&self, rule: Vec<String>) -> Result<bool> {
        self.remove_named_grouping_policy("g", rule)
    }

    pub fn remove_named_grouping_policy(&self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.remove_policy_internal("g", ptype, rule)
    }

    fn dispatch_mutation(
        &self,
        op: PolicyOp,
        sec: &str,
        ptype: &str,
        rule: &[String],
    ) -> Option<Result<bool>> {
        if !self.state_read().auto_notify_dispatcher {
            return None;
        }
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        let dispatcher = dispatcher.as_mut()?;
        let rules = vec![rule.to_vec()];
        let outcome = match op {
            PolicyOp::Add => dispatcher.add_policies(sec, ptype, &rules),
            PolicyOp::Remove => dispatcher.remove_policies(sec, ptype, &rules),
        };
        Some(outcome.map(|()| true).map_err(Error::Dispatcher))
    }

    fn add_policy_internal(&self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        if let Some(outcome) = self.dispatch_mutation(PolicyOp::Add, sec, ptype, &rule) {
            return outcome;
        }

        let notify;
        {
            let mut state = self.state_write();
            if state.model.has_policy(sec, ptype, &rule) {
                return Ok(false);
            }

            if state.auto_save {
                if let Some(adapter) = &state.adapter {
                    if let Err(error) = adapter.add_policy(sec, ptype, &rule) {
                        if error.downcast_ref::<NotImplemented>().is_none() {
                            return Err(Error::Storage(error));
                        }
                    }
                }
            }

            state.model.add_policy_rule(sec, ptype, rule.clone())?;
            if sec == "g" && state.auto_build_role_links {
                state.model.build_incremental_role_links(
                    &state.rm_map,
                    PolicyOp::Add,
                    ptype,
                    std::slice::from_ref(&rule),
                )?;
            }
            notify = state.auto_notify_watcher;
        }

        if notify {
            self.notify_watcher()?;
        }
        Ok(true)
    }

    fn remove_policy_internal(&self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        if let Some(outcome) = self.dispatch_mutation(PolicyOp::Remove, sec, ptype, &rule) {
            return outcome;
        }

        let notify;
        {
            let mut state = self.state_write();
            if !state.model.has_policy(sec, ptype, &rule) {
                return Ok(false);
            }

            if state.auto_save {
                if let Some(adapter) = &state.adapter {
                    if let Err(error) = adapter.remove_policy(sec, ptype, &rule) {
                        if error.downcast_ref::<NotImplemented>().is_none() {
                            return Err(Error::Storage(error));
                        }
                    }
                }
            }

            state.model.remove_policy_rule(sec, ptype, &rule)?;
            if sec == "g" && state.auto_build_role_links {
                state.model.build_incremental_role_links(
                    &state.rm_map,
                    PolicyOp::Remove,
                    ptype,
                    std::slice::from_ref(&rule),
                )?;
            }
            notify = state.auto_notify_watcher;
        }

        if notify {
            self.notify_watcher()?;
        }
        Ok(true)
    }
}
