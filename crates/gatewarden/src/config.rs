//! Reader for the INI-style model DSL.
//!
//! A model document is a sequence of bracketed sections, each holding
//! `key = value` lines. `#` starts a comment, and a line ending in `\`
//! continues on the next line:
//!
//! ```text
//! [request_definition]
//! r = sub, obj, act
//!
//! [matchers]
//! m = r.sub == p.sub && \
//!     r.obj == p.obj && r.act == p.act
//! ```

use crate::error::{Error, Result};

/// One parsed `[section]` with its entries in document order.
#[derive(Debug)]
pub(crate) struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// Parse a model document into its sections.
///
/// Unknown structure (an entry before any section header, a line without
/// `=`, an unterminated continuation) is an `InvalidModel` error.
pub(crate) fn parse(text: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    let mut pending = String::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_suffix('\\') {
            pending.push_str(rest.trim_end());
            pending.push(' ');
            continue;
        }

        let full = if pending.is_empty() {
            line
        } else {
            let joined = format!("{pending}{line}");
            pending.clear();
            joined
        };

        if let Some(name) = full.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            sections.push(Section {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        let (key, value) = full.split_once('=').ok_or_else(|| {
            Error::InvalidModel(format!("line {}: expected `key = value`, got `{full}`", lineno + 1))
        })?;

        let section = sections.last_mut().ok_or_else(|| {
            Error::InvalidModel(format!(
                "line {}: entry `{}` appears before any [section] header",
                lineno + 1,
                key.trim()
            ))
        })?;
        section
            .entries
            .push((key.trim().to_string(), value.trim().to_string()));
    }

    if !pending.is_empty() {
        return Err(Error::InvalidModel(
            "document ends inside a `\\` line continuation".to_string(),
        ));
    }

    Ok(sections)
}

/// Strip a `#` comment unless the hash sits inside a quoted string.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes: Option<char> = None;
    for (i, ch) in line.char_indices() {
        match (ch, in_quotes) {
            ('"' | '\'', None) => in_quotes = Some(ch),
            (q, Some(open)) if q == open => in_quotes = None,
            ('#', None) => return &line[..i],
            _ => {}
        }
    }
    line
}
