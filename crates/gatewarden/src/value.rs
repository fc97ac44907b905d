use std::fmt;

/// A typed request value supplied at decision time.
///
/// Policy fields are always strings; request values may carry structure.
/// The `Json` variant supports dotted field access inside matcher
/// expressions (`r.sub.Age > 18`) and the textual JSON-substitution mode.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Json(_) => "json",
        }
    }
}

/// `Int` and `Float` compare numerically across variants; everything else
/// compares within its own variant and mixed variants are unequal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// Convert a JSON leaf into the closest typed value. Arrays, objects, and
/// null stay in the `Json` variant so comparisons remain structural.
pub(crate) fn from_json_leaf(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        other => Value::Json(other.clone()),
    }
}

/// Conversion of heterogeneous argument tuples into a request value list.
///
/// Lets call sites write `enforce(("alice", "data1", "read"))` instead of
/// building a `Vec<Value>` by hand.
pub trait EnforceArgs {
    fn into_vals(self) -> Vec<Value>;
}

impl EnforceArgs for Vec<Value> {
    fn into_vals(self) -> Vec<Value> {
        self
    }
}

impl EnforceArgs for () {
    fn into_vals(self) -> Vec<Value> {
        Vec::new()
    }
}

macro_rules! impl_enforce_args {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> EnforceArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_vals(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into()),+]
            }
        }
    };
}

impl_enforce_args!(A);
impl_enforce_args!(A, B);
impl_enforce_args!(A, B, C);
impl_enforce_args!(A, B, C, D);
impl_enforce_args!(A, B, C, D, E);
impl_enforce_args!(A, B, C, D, E, F);
impl_enforce_args!(A, B, C, D, E, F, G);
impl_enforce_args!(A, B, C, D, E, F, G, H);
