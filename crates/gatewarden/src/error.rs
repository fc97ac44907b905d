use thiserror::Error;

/// Every failure the decision core can surface.
///
/// Request- and model-validation failures fail the single decision that
/// triggered them; the enforcer stays usable for subsequent calls.
/// `Storage` and `Watcher` wrap collaborator errors raised on the load/save
/// paths and never occur inside a decision.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no assertion `{key}` in model section `{section}`")]
    UnknownAssertion { section: String, key: String },

    #[error("invalid request size: expected {expected} values, got {got}")]
    RequestArity { expected: usize, got: usize },

    #[error("invalid policy size for `{ptype}`: expected {expected} fields, got {got}")]
    PolicyArity {
        ptype: String,
        expected: usize,
        got: usize,
    },

    #[error("failed to compile expression `{source_text}`: {reason}")]
    Compile { source_text: String, reason: String },

    #[error("expression evaluation error: {0}")]
    Eval(String),

    #[error("matcher result should be a bool or a number, got {got}")]
    MatcherResult { got: &'static str },

    #[error("`eval()` requires at least one policy rule to read sub-expressions from")]
    EvalWithoutPolicy,

    #[error("unsupported effect expression `{0}`")]
    UnsupportedEffect(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("failed to read model file `{path}`")]
    ModelIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot save a filtered policy")]
    SaveFiltered,

    #[error("storage adapter error")]
    Storage(#[source] anyhow::Error),

    #[error("watcher error")]
    Watcher(#[source] anyhow::Error),

    #[error("dispatcher error")]
    Dispatcher(#[source] anyhow::Error),

    #[error("evaluation fault: {0}")]
    EvaluationFault(String),
}

pub type Result<T> = std::result::Result<T, Error>;
