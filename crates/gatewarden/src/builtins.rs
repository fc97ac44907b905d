//! Built-in matcher functions and the function table they live in.
//!
//! All functions take the evaluator's argument slice and return a value,
//! so user-registered functions share the same shape. Registration
//! precedence is built-ins < user functions < auto-injected role-graph
//! functions; later layers emit a diagnostic when they shadow an earlier
//! name rather than replacing it silently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use globset::Glob;
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::value::Value;

/// The shape of every matcher-callable function.
pub type ExprFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Name → function registry bound into each compiled-expression evaluation.
/// Cloning is cheap: entries are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct FunctionTable {
    map: HashMap<String, ExprFn>,
}

impl FunctionTable {
    /// A table pre-loaded with the built-in matchers.
    pub fn with_builtins() -> Self {
        let mut table = Self::default();
        table.map.insert("keyMatch".into(), Arc::new(key_match));
        table.map.insert("keyMatch2".into(), Arc::new(key_match2));
        table.map.insert("regexMatch".into(), Arc::new(regex_match));
        table.map.insert("globMatch".into(), Arc::new(glob_match));
        table.map.insert("ipMatch".into(), Arc::new(ip_match));
        table
    }

    /// Register a user function, warning when it shadows an existing name.
    pub fn register(&mut self, name: impl Into<String>, f: ExprFn) {
        let name = name.into();
        if self.map.contains_key(&name) {
            warn!(function = %name, "user function shadows an existing function");
        }
        self.map.insert(name, f);
    }

    /// Insert an auto-generated role-graph function. These take precedence
    /// over everything else, so a shadowed name is worth a diagnostic.
    pub(crate) fn register_role_fn(&mut self, name: &str, f: ExprFn) {
        if self.map.contains_key(name) {
            warn!(
                function = name,
                "auto-injected role-graph function shadows a registered function"
            );
        }
        self.map.insert(name.to_string(), f);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ExprFn> {
        self.map.get(name)
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

fn expect_str<'a>(args: &'a [Value], index: usize, fname: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Eval(format!("{fname}() expects string argument #{}", index + 1)))
}

fn expect_arity(args: &[Value], arity: usize, fname: &str) -> Result<()> {
    if args.len() != arity {
        return Err(Error::Eval(format!(
            "{fname}() expects {arity} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Key-prefix match: `*` in the pattern matches any suffix.
/// `keyMatch("/foo/bar", "/foo/*")` is true.
pub fn key_match(args: &[Value]) -> Result<Value> {
    expect_arity(args, 2, "keyMatch")?;
    let key = expect_str(args, 0, "keyMatch")?;
    let pattern = expect_str(args, 1, "keyMatch")?;

    let matched = match pattern.find('*') {
        None => key == pattern,
        Some(i) => {
            if key.len() > i {
                key.as_bytes()[..i] == pattern.as_bytes()[..i]
            } else {
                key == &pattern[..i]
            }
        }
    };
    Ok(Value::Bool(matched))
}

/// Path match with `:param` placeholders: `keyMatch2("/res/1", "/res/:id")`.
pub fn key_match2(args: &[Value]) -> Result<Value> {
    expect_arity(args, 2, "keyMatch2")?;
    let key = expect_str(args, 0, "keyMatch2")?;
    let pattern = expect_str(args, 1, "keyMatch2")?;

    let mut regex_src = regex::escape(pattern).replace("/\\*", "/.*");
    // `:param` segments (escaped or not) match one path segment.
    let param = Regex::new(r":[^/]+").expect("static regex");
    regex_src = param.replace_all(&regex_src, "[^/]+").into_owned();

    match Regex::new(&format!("^{regex_src}$")) {
        Ok(re) => Ok(Value::Bool(re.is_match(key))),
        Err(e) => {
            warn!(pattern, error = %e, "keyMatch2 pattern did not compile; treating as non-match");
            Ok(Value::Bool(false))
        }
    }
}

/// Full regular-expression match over the first argument.
pub fn regex_match(args: &[Value]) -> Result<Value> {
    expect_arity(args, 2, "regexMatch")?;
    let key = expect_str(args, 0, "regexMatch")?;
    let pattern = expect_str(args, 1, "regexMatch")?;

    match Regex::new(pattern) {
        Ok(re) => Ok(Value::Bool(re.is_match(key))),
        Err(e) => {
            warn!(pattern, error = %e, "failed to compile regex; treating as non-match");
            Ok(Value::Bool(false))
        }
    }
}

/// Glob match with full `globset` semantics (`**`, `?`, character classes).
pub fn glob_match(args: &[Value]) -> Result<Value> {
    expect_arity(args, 2, "globMatch")?;
    let key = expect_str(args, 0, "globMatch")?;
    let pattern = expect_str(args, 1, "globMatch")?;

    match Glob::new(pattern) {
        Ok(glob) => Ok(Value::Bool(glob.compile_matcher().is_match(key))),
        Err(e) => {
            warn!(pattern, error = %e, "failed to compile glob; treating as non-match");
            Ok(Value::Bool(false))
        }
    }
}

/// IP equality or CIDR containment: `ipMatch("192.168.2.1", "192.168.2.0/24")`.
pub fn ip_match(args: &[Value]) -> Result<Value> {
    expect_arity(args, 2, "ipMatch")?;
    let ip1 = expect_str(args, 0, "ipMatch")?;
    let ip2 = expect_str(args, 1, "ipMatch")?;

    let addr: IpAddr = ip1
        .parse()
        .map_err(|_| Error::Eval(format!("ipMatch() first argument `{ip1}` is not an IP address")))?;

    let matched = match ip2.split_once('/') {
        None => match ip2.parse::<IpAddr>() {
            Ok(other) => addr == other,
            Err(_) => false,
        },
        Some((network, prefix)) => {
            match (network.parse::<IpAddr>(), prefix.parse::<u32>()) {
                (Ok(network), Ok(prefix)) => cidr_contains(network, prefix, addr),
                _ => false,
            }
        }
    };
    Ok(Value::Bool(matched))
}

fn cidr_contains(network: IpAddr, prefix: u32, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        // Mixed address families never match.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(f: fn(&[Value]) -> Result<Value>, a: &str, b: &str) -> bool {
        f(&[Value::from(a), Value::from(b)]).unwrap() == Value::Bool(true)
    }

    // ---- keyMatch ----

    #[test]
    fn key_match_prefix() {
        assert!(check(key_match, "/foo/bar", "/foo/*"));
        assert!(check(key_match, "/foo", "/foo"));
        assert!(check(key_match, "/foo", "/foo*"));
        assert!(!check(key_match, "/bar/foo", "/foo/*"));
        assert!(!check(key_match, "/foo", "/foo/*"));
    }

    // ---- keyMatch2 ----

    #[test]
    fn key_match2_params_and_wildcards() {
        assert!(check(key_match2, "/resource1", "/:resource"));
        assert!(check(key_match2, "/res/123", "/res/:id"));
        assert!(check(key_match2, "/foo/bar/baz", "/foo/*"));
        assert!(!check(key_match2, "/res/123/extra", "/res/:id"));
        assert!(!check(key_match2, "/other/123", "/res/:id"));
    }

    // ---- regexMatch ----

    #[test]
    fn regex_match_basic() {
        assert!(check(regex_match, "/topic/create/123", r"/topic/create/\d+"));
        assert!(!check(regex_match, "/topic/delete", r"/topic/create/\d+"));
    }

    #[test]
    fn regex_match_invalid_pattern_is_non_match() {
        assert!(!check(regex_match, "anything", "[invalid"));
    }

    // ---- globMatch ----

    #[test]
    fn glob_match_double_star() {
        assert!(check(glob_match, "/etc/nginx/nginx.conf", "/etc/**"));
        assert!(!check(glob_match, "/var/log/syslog", "/etc/**"));
    }

    #[test]
    fn glob_match_invalid_pattern_is_non_match() {
        assert!(!check(glob_match, "/anything", "[invalid"));
    }

    // ---- ipMatch ----

    #[test]
    fn ip_match_cidr_and_equality() {
        assert!(check(ip_match, "192.168.2.123", "192.168.2.0/24"));
        assert!(check(ip_match, "10.0.0.1", "10.0.0.1"));
        assert!(!check(ip_match, "192.168.3.1", "192.168.2.0/24"));
        assert!(!check(ip_match, "10.0.0.2", "10.0.0.1"));
    }

    #[test]
    fn ip_match_v6() {
        assert!(check(ip_match, "2001:db8::1", "2001:db8::/32"));
        assert!(!check(ip_match, "2001:db9::1", "2001:db8::/48"));
        // Mixed families never match.
        assert!(!check(ip_match, "192.168.2.1", "2001:db8::/32"));
    }

    #[test]
    fn ip_match_rejects_non_ip_request() {
        assert!(ip_match(&[Value::from("not-an-ip"), Value::from("10.0.0.0/8")]).is_err());
    }

    // ---- function table ----

    #[test]
    fn builtins_are_registered() {
        let table = FunctionTable::with_builtins();
        for name in ["keyMatch", "keyMatch2", "regexMatch", "globMatch", "ipMatch"] {
            assert!(table.get(name).is_some(), "missing builtin {name}");
        }
    }

    #[test]
    fn user_registration_overrides() {
        let mut table = FunctionTable::with_builtins();
        table.register("keyMatch", Arc::new(|_: &[Value]| Ok(Value::Bool(false))));
        let f = table.get("keyMatch").unwrap();
        assert_eq!(
            f(&[Value::from("/a"), Value::from("/a")]).unwrap(),
            Value::Bool(false)
        );
    }
}
