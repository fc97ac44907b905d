//! Expression-source normalization helpers shared by the model registry and
//! the enforcer.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::value::Value;

fn assertion_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([rp]\d*)\.").expect("static regex"))
}

/// Rewrite `r.sub` / `p2.obj`-style section references into the underscore
/// form (`r_sub`, `p2_obj`) used by the variable resolver.
pub(crate) fn escape_assertion(source: &str) -> String {
    assertion_ref_regex()
        .replace_all(source, "${1}_")
        .into_owned()
}

/// Strip a trailing `#` comment and surrounding whitespace.
pub(crate) fn remove_comments(source: &str) -> String {
    match source.find('#') {
        Some(pos) => source[..pos].trim().to_string(),
        None => source.trim().to_string(),
    }
}

fn eval_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\beval\(").expect("static regex"))
}

/// Whether a matcher source contains an `eval()` call. Such matchers read
/// sub-expressions out of policy data and must never be cached.
pub(crate) fn has_eval(source: &str) -> bool {
    eval_regex().is_match(source)
}

fn json_access_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"r\d*[_.][A-Za-z_0-9]+\.[A-Za-z_0-9.]*[A-Za-z_0-9]").expect("static regex")
    })
}

fn json_access_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"r\d*[_.][A-Za-z_0-9]+\.").expect("static regex"))
}

/// Textually replace `r_xxx.path.to.field` occurrences with the literal
/// extracted from the corresponding JSON request value.
///
/// Numbers are substituted bare, everything else is double-quoted. The
/// transform is pure: output depends only on the inputs.
pub(crate) fn request_json_replace(
    source: &str,
    r_tokens: &HashMap<String, usize>,
    r_vals: &[Value],
) -> String {
    let mut out = source.to_string();
    let matches: Vec<String> = json_access_regex()
        .find_iter(source)
        .map(|m| m.as_str().to_string())
        .collect();

    for access in matches {
        let Some(prefix) = json_access_prefix_regex().find(&access) else {
            continue;
        };
        let token = access[..prefix.end() - 1].replace('.', "_");
        let json_path = &access[prefix.end()..];

        let Some(&index) = r_tokens.get(&token) else {
            continue;
        };
        let Some(val) = r_vals.get(index) else {
            continue;
        };

        let parsed: serde_json::Value;
        let root = match val {
            Value::Json(v) => v,
            Value::Str(s) => match serde_json::from_str(s) {
                Ok(v) => {
                    parsed = v;
                    &parsed
                }
                Err(_) => continue,
            },
            _ => continue,
        };

        let extracted = json_path
            .split('.')
            .fold(root, |acc, seg| acc.get(seg).unwrap_or(&serde_json::Value::Null));

        let literal = match extracted {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("\"{s}\""),
            serde_json::Value::Null => "\"\"".to_string(),
            other => format!("\"{other}\""),
        };
        out = out.replace(&access, &literal);
    }
    out
}

/// Split a CSV policy line into trimmed fields. Double-quoted fields may
/// contain commas; `""` inside a quoted field is an escaped quote.
pub(crate) fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() => {
                in_quotes = true;
                current.clear();
            }
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_rewrites_section_refs() {
        assert_eq!(
            escape_assertion("r.sub == p.sub && r.obj == p.obj"),
            "r_sub == p_sub && r_obj == p_obj"
        );
        assert_eq!(escape_assertion("eval(p2.sub_rule)"), "eval(p2_sub_rule)");
        assert_eq!(escape_assertion("r.sub.Age > 18"), "r_sub.Age > 18");
    }

    #[test]
    fn escape_leaves_unrelated_dots_alone() {
        assert_eq!(escape_assertion("\"a.b\" == r.obj"), "\"a.b\" == r_obj");
    }

    #[test]
    fn comments_stripped() {
        assert_eq!(remove_comments("r.sub == p.sub # owner check"), "r.sub == p.sub");
        assert_eq!(remove_comments("  r.act == p.act  "), "r.act == p.act");
    }

    #[test]
    fn eval_detection() {
        assert!(has_eval("eval(p.sub_rule) && r.obj == p.obj"));
        assert!(has_eval("r.obj == p.obj || eval(p2.cond)"));
        assert!(!has_eval("myeval(r.sub)"));
        assert!(!has_eval("r.sub == p.sub"));
    }

    #[test]
    fn json_replace_substitutes_fields() {
        let mut tokens = HashMap::new();
        tokens.insert("r_sub".to_string(), 0);
        let vals = vec![Value::Json(serde_json::json!({"Age": 30, "Name": "alice"}))];

        assert_eq!(
            request_json_replace("r_sub.Age > 18", &tokens, &vals),
            "30 > 18"
        );
        assert_eq!(
            request_json_replace("r_sub.Name == p_sub", &tokens, &vals),
            "\"alice\" == p_sub"
        );
    }

    #[test]
    fn json_replace_accepts_string_payloads() {
        let mut tokens = HashMap::new();
        tokens.insert("r_sub".to_string(), 0);
        let vals = vec![Value::Str(r#"{"Owner": "bob"}"#.to_string())];

        assert_eq!(
            request_json_replace("r_sub.Owner == \"bob\"", &tokens, &vals),
            "\"bob\" == \"bob\""
        );
    }

    #[test]
    fn json_replace_missing_path_becomes_empty_string() {
        let mut tokens = HashMap::new();
        tokens.insert("r_sub".to_string(), 0);
        let vals = vec![Value::Json(serde_json::json!({"Age": 30}))];

        assert_eq!(
            request_json_replace("r_sub.Nope == \"\"", &tokens, &vals),
            "\"\" == \"\""
        );
    }

    #[test]
    fn json_replace_is_deterministic() {
        let mut tokens = HashMap::new();
        tokens.insert("r_sub".to_string(), 0);
        tokens.insert("r_obj".to_string(), 1);
        let vals = vec![
            Value::Json(serde_json::json!({"Age": 30})),
            Value::Json(serde_json::json!({"Owner": "alice"})),
        ];
        let src = "r_sub.Age > 18 && r_obj.Owner == \"alice\" && r_sub.Age < 65";

        let once = request_json_replace(src, &tokens, &vals);
        let twice = request_json_replace(src, &tokens, &vals);
        assert_eq!(once, twice);
        assert_eq!(once, "30 > 18 && \"alice\" == \"alice\" && 30 < 65");
    }

    #[test]
    fn csv_split_basic() {
        assert_eq!(
            split_csv_line("p, alice, data1, read"),
            vec!["p", "alice", "data1", "read"]
        );
    }

    #[test]
    fn csv_split_quoted_commas() {
        assert_eq!(
            split_csv_line(r#"p2, "r.sub.Age > 18, r.sub.Age < 60", /data1, read"#),
            vec!["p2", "r.sub.Age > 18, r.sub.Age < 60", "/data1", "read"]
        );
    }

    #[test]
    fn csv_split_escaped_quote() {
        assert_eq!(split_csv_line(r#"p, "say ""hi""", obj"#), vec!["p", "say \"hi\"", "obj"]);
    }
}
