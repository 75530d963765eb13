use serde::{Deserialize, Serialize};

use crate::scope::Scope;

/// A rule `name`/`contentName`. Most are static and parsed once; names referring to capture
/// groups (`entity.name.$1`, `${2:/downcase}`) are rebuilt from the matched text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeName {
    raw: String,
    scopes: Vec<Scope>,
    has_captures: bool,
}

impl ScopeName {
    pub fn new(raw: String) -> Self {
        let has_captures = has_capture_references(&raw);
        let scopes = if has_captures {
            Vec::new()
        } else {
            Scope::parse_names(&raw)
        };
        Self {
            raw,
            scopes,
            has_captures,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The scopes for this name given the captures of the match that triggered it
    pub fn resolve(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        if !self.has_captures {
            return self.scopes.clone();
        }
        Scope::parse_names(&substitute_captures(&self.raw, line, captures))
    }
}

fn has_capture_references(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.iter().enumerate().any(|(i, b)| {
        *b == b'$'
            && bytes
                .get(i + 1)
                .is_some_and(|next| next.is_ascii_digit() || *next == b'{')
    })
}

/// Replaces `$n`, `${n}`, `${n:/downcase}` and `${n:/upcase}` with the captured text.
/// Leading dots are stripped from the captured text as vscode-textmate does.
fn substitute_captures(name: &str, line: &str, captures: &[Option<(usize, usize)>]) -> String {
    let captured = |index: usize| -> &str {
        match captures.get(index) {
            Some(Some((start, end))) => line[*start..*end].trim_start_matches('.'),
            _ => "",
        }
    };

    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let index = digits.parse().unwrap_or(usize::MAX);
            out.push_str(captured(index));
            rest = &after[digits.len()..];
            continue;
        }

        if let Some(inner) = after.strip_prefix('{')
            && let Some(close) = inner.find('}')
        {
            let body = &inner[..close];
            let (index, command) = body.split_once(":/").unwrap_or((body, ""));
            if let Ok(index) = index.parse::<usize>() {
                let text = captured(index);
                match command {
                    "downcase" => out.push_str(&text.to_lowercase()),
                    "upcase" => out.push_str(&text.to_uppercase()),
                    _ => out.push_str(text),
                }
                rest = &inner[close + 1..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}

/// What an `include` points to.
///
///  * `$self`: the root of the grammar containing the include
///  * `$base`: the root of the grammar the tokenization started with
///  * `#name`: a repository entry, looked up from the innermost repository outwards
///  * `source.soql` / `source.soql#name`: another grammar, or one of its repository entries
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Reference {
    Self_,
    Base,
    Local(String),
    External { scope: String, rule: Option<String> },
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        match value {
            "$self" => Self::Self_,
            "$base" => Self::Base,
            s if s.starts_with('#') => Self::Local(s[1..].to_string()),
            s => match s.split_once('#') {
                Some((scope, rule)) => Self::External {
                    scope: scope.to_string(),
                    rule: Some(rule.to_string()),
                },
                None => Self::External {
                    scope: s.to_string(),
                    rule: None,
                },
            },
        }
    }
}
