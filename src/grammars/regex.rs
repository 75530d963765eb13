use std::fmt;
use std::sync::{Arc, OnceLock};

use onig::{Region, RegexOptions, SearchOptions, Syntax};
use serde::{Deserialize, Serialize};

use crate::tokenizer::anchors::{AnchorActive, has_anchors};

/// Capture group positions of a match, index 0 being the whole match.
/// Positions are byte offsets in the searched line.
pub type CapturePositions = Vec<Option<(usize, usize)>>;

/// Compiles a pattern the way every grammar regex is compiled: numbered groups are kept
/// even when the pattern also has named groups.
pub(crate) fn compile_onig(pattern: &str) -> Result<onig::Regex, onig::Error> {
    onig::Regex::with_options(
        pattern,
        RegexOptions::REGEX_OPTION_CAPTURE_GROUP,
        Syntax::default(),
    )
}

/// A regex wrapper that serializes as a string but compiles lazily at runtime.
///
/// Patterns using `\A` or `\G` get one compiled variant per anchor state.
pub struct Regex {
    pattern: String,
    compiled: [OnceLock<Option<Arc<onig::Regex>>>; 4],
}

impl Clone for Regex {
    fn clone(&self) -> Self {
        Regex::new(self.pattern.clone())
    }
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Regex {
    pub fn new(pattern: String) -> Self {
        Self {
            pattern,
            compiled: Default::default(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The compiled regex for the given anchor state, `None` if the pattern is invalid.
    pub fn compiled(&self, anchors: AnchorActive) -> Option<&Arc<onig::Regex>> {
        let slot = if has_anchors(&self.pattern) {
            anchors.index()
        } else {
            AnchorActive::AG.index()
        };
        self.compiled[slot]
            .get_or_init(|| {
                compile_onig(&anchors.replace_anchors(&self.pattern))
                    .ok()
                    .map(Arc::new)
            })
            .as_ref()
    }

    /// Validate that this regex pattern compiles successfully.
    /// Backreferences are blanked first since end patterns only get their final shape
    /// once the begin pattern matched.
    pub fn validate(&self) -> Result<(), String> {
        let pattern = if self.has_backreferences() {
            resolve_backreferences(&self.pattern, "", &[])
        } else {
            self.pattern.clone()
        };
        compile_onig(&pattern)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    pub fn has_backreferences(&self) -> bool {
        find_backreferences(&self.pattern).next().is_some()
    }

    /// Searches `text` from `pos` to its end. The match does not have to start at `pos` and
    /// the text before `pos` is still visible to look-behinds.
    pub fn find_at(&self, text: &str, pos: usize, anchors: AnchorActive) -> Option<CapturePositions> {
        let re = self.compiled(anchors)?;
        if pos > text.len() {
            return None;
        }
        let mut region = Region::new();
        re.search_with_options(
            text,
            pos,
            text.len(),
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        )?;
        Some((0..region.len()).map(|i| region.pos(i)).collect())
    }
}

impl Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Ok(Regex::new(pattern))
    }
}

/// Yields `(byte_start, byte_end, group)` for every `\1`..`\9` in the pattern, skipping
/// escaped backslashes.
fn find_backreferences(pattern: &str) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    std::iter::from_fn(move || {
        while i + 1 < bytes.len() {
            if bytes[i] != b'\\' {
                i += 1;
                continue;
            }
            let next = bytes[i + 1];
            let start = i;
            i += 2;
            if next.is_ascii_digit() && next != b'0' {
                return Some((start, start + 2, (next - b'0') as usize));
            }
        }
        None
    })
}

/// Escapes every regex metacharacter so captured text can be spliced into a pattern.
pub fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '|' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '.' | '*' | '+' | '?'
                | '-' | ',' | '#' | ' ' | '\t'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Replaces `\1`..`\9` in an end/while pattern with the (escaped) text the begin pattern
/// captured, e.g. a begin of `(['"])` with an end of `\1` closes on the same quote.
/// Groups that did not participate in the match are replaced by nothing.
pub fn resolve_backreferences(pattern: &str, line: &str, captures: &[Option<(usize, usize)>]) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut last = 0;
    for (start, end, group) in find_backreferences(pattern) {
        out.push_str(&pattern[last..start]);
        if let Some(Some((cap_start, cap_end))) = captures.get(group) {
            out.push_str(&escape_regex(&line[*cap_start..*cap_end]));
        }
        last = end;
    }
    out.push_str(&pattern[last..]);
    out
}
