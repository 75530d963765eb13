//! Injection selectors: which scopes an injected rule applies to.
//!
//! `L:(meta.soql | string.quoted) -comment, R:source.apex`

use std::sync::LazyLock;

use onig::Regex;
use serde::{Deserialize, Serialize};

use crate::scope::Scope;

/// Which side wins when an injected rule and a normal rule match at the same position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectionPrecedence {
    /// `L:`, the injection wins
    Left,
    /// `R:`, the normal rule wins
    Right,
}

/// One comma separated part of an injection selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionMatcher {
    matcher: SelectorMatcher,
    precedence: Option<InjectionPrecedence>,
}

impl InjectionMatcher {
    /// Scopes are ordered from the outermost one
    pub fn matches(&self, scopes: &[Scope]) -> bool {
        self.matcher.matches(scopes)
    }

    pub fn precedence(&self) -> Option<InjectionPrecedence> {
        self.precedence
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorMatcher {
    /// Space separated scopes that must appear in that order, not necessarily adjacent
    Path(Vec<Scope>),
    And(Vec<SelectorMatcher>),
    /// `|` or `,` inside parentheses
    Or(Vec<SelectorMatcher>),
    /// `-` prefix
    Not(Box<SelectorMatcher>),
}

impl SelectorMatcher {
    fn matches(&self, scopes: &[Scope]) -> bool {
        match self {
            SelectorMatcher::Path(path) => {
                let mut remaining = scopes.iter();
                path.iter()
                    .all(|wanted| remaining.any(|scope| wanted.is_prefix_of(scope)))
            }
            SelectorMatcher::And(all) => all.iter().all(|m| m.matches(scopes)),
            SelectorMatcher::Or(any) => any.iter().any(|m| m.matches(scopes)),
            SelectorMatcher::Not(inner) => !inner.matches(scopes),
        }
    }
}

/// Same tokens as vscode-textmate, with `*` allowed in scopes
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([LR]:|[\w.:]+[\w\*.:\-]*|[,|\-()])").expect("Invalid selector regex")
});

fn is_identifier(s: &str) -> bool {
    if s.is_empty() || s == "-" {
        return false;
    }

    s.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '-' || c == '*'
    })
}

/// `meta.tag.*.html` only keeps what's before the wildcard
fn scope_from_token(token: &str) -> Scope {
    match token.find(".*") {
        Some(pos) => Scope::new(&token[..pos]),
        None => Scope::new(token),
    }
}

fn parse_inner_expression(tokens: &[&str], position: &mut usize) -> Option<SelectorMatcher> {
    let mut out = Vec::new();
    while let Some(m) = parse_conjunction(tokens, position) {
        if !out.contains(&m) {
            out.push(m);
        }
        if *position < tokens.len() && matches!(tokens[*position], "|" | ",") {
            *position += 1;
        } else {
            break;
        }
    }

    match out.len() {
        0 => None,
        1 => out.pop(),
        _ => Some(SelectorMatcher::Or(out)),
    }
}

fn parse_operand(tokens: &[&str], position: &mut usize) -> Option<SelectorMatcher> {
    let token = *tokens.get(*position)?;

    match token {
        "-" => {
            *position += 1;
            let negated = parse_operand(tokens, position)?;
            Some(SelectorMatcher::Not(Box::new(negated)))
        }
        "(" => {
            *position += 1;
            let inner = parse_inner_expression(tokens, position);
            if *position < tokens.len() && tokens[*position] == ")" {
                *position += 1;
            }
            inner
        }
        _ => {
            let mut path = Vec::new();
            while *position < tokens.len() && is_identifier(tokens[*position]) {
                path.push(scope_from_token(tokens[*position]));
                *position += 1;
            }
            if path.is_empty() {
                None
            } else {
                Some(SelectorMatcher::Path(path))
            }
        }
    }
}

fn parse_conjunction(tokens: &[&str], position: &mut usize) -> Option<SelectorMatcher> {
    let mut matchers = Vec::new();

    while let Some(m) = parse_operand(tokens, position) {
        matchers.push(m);
    }

    match matchers.len() {
        0 => None,
        1 => matchers.pop(),
        _ => Some(SelectorMatcher::And(matchers)),
    }
}

/// Parses an injection selector into its comma separated matchers
pub fn parse_injection_selector(selector: &str) -> Vec<InjectionMatcher> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Vec::new();
    }

    let tokens: Vec<_> = TOKEN_REGEX
        .find_iter(selector)
        .map(|(start, end)| &selector[start..end])
        .collect();
    let mut position = 0;
    let mut res = Vec::new();

    let mut precedence = None;
    while position < tokens.len() {
        match tokens[position] {
            "L:" => {
                precedence = Some(InjectionPrecedence::Left);
                position += 1;
                continue;
            }
            "R:" => {
                precedence = Some(InjectionPrecedence::Right);
                position += 1;
                continue;
            }
            _ => (),
        };

        let Some(matcher) = parse_conjunction(&tokens, &mut position) else {
            break;
        };
        res.push(InjectionMatcher {
            matcher,
            precedence,
        });
        precedence = None;
        if position < tokens.len() && tokens[position] == "," {
            position += 1;
        } else {
            break;
        }
    }

    if position < tokens.len() {
        log::warn!(
            "Ignoring the end of injection selector {selector:?} from {:?}",
            tokens[position]
        );
    }

    res
}
