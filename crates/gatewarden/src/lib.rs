//! # gatewarden
//!
//! Embeddable authorization decision core. The access-control *model* (a
//! small configuration DSL), the *policy* (rows of tuples), and the
//! *storage* of those tuples are decoupled: the model declares a request
//! schema, a policy schema, optional role definitions, an effect
//! expression, and a matcher expression; the enforcer evaluates the
//! matcher against each policy tuple and reduces the per-tuple effects to
//! a boolean decision.
//!
//! ## Quick start
//!
//! ```rust
//! use gatewarden::{Enforcer, Model};
//!
//! # fn main() -> gatewarden::Result<()> {
//! let model = Model::from_text(
//!     r#"
//! [request_definition]
//! r = sub, obj, act
//!
//! [policy_definition]
//! p = sub, obj, act
//!
//! [policy_effect]
//! e = some(where (p.eft == allow))
//!
//! [matchers]
//! m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
//! "#,
//! )?;
//!
//! let enforcer = Enforcer::new(model)?;
//! enforcer.add_policy(vec!["alice".into(), "data1".into(), "read".into()])?;
//!
//! assert!(enforcer.enforce(("alice", "data1", "read"))?);
//! assert!(!enforcer.enforce(("alice", "data1", "write"))?);
//! # Ok(())
//! # }
//! ```
//!
//! Role-based models add a `[role_definition]` section; its assertions are
//! exposed to matchers as functions (`g(r.sub, p.sub)`) answering
//! reachability in the corresponding role graph. Decisions are safe to run
//! concurrently from many threads against one shared `Enforcer`; policy
//! reloads install a new snapshot atomically.

mod adapter;
mod builtins;
mod config;
mod effect;
mod enforcer;
mod error;
mod expr;
mod model;
mod policy;
mod role_graph;
mod util;
mod value;
mod watcher;

// Re-export the primary public API at the crate root.
pub use adapter::{load_policy_line, Adapter, FileAdapter, Filter, MemoryAdapter, NotImplemented};
pub use builtins::{glob_match, ip_match, key_match, key_match2, regex_match, ExprFn, FunctionTable};
pub use effect::{DefaultEffector, Effect, Effector};
pub use enforcer::{EnforceContext, Enforcer};
pub use error::{Error, Result};
pub use model::{Assertion, Model, PolicyOp};
pub use role_graph::{MatchingFn, RoleGraph, DEFAULT_MAX_DEPTH};
pub use value::{EnforceArgs, Value};
pub use watcher::{Dispatcher, UpdateCallback, Watcher};
