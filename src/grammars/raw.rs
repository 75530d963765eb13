use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Deref;
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::TintexResult;
use crate::grammars::compiled::{CompiledGrammar, GrammarError, GrammarId};
use crate::options::LoadOptions;

/// Capture groups of a `match`/`begin`/`end`/`while` pattern, keyed by group number.
///
/// ```json
/// {
///   "1": { "name": "storage.modifier.apex" },
///   "2": { "name": "entity.name.type.class.apex" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captures(pub BTreeMap<usize, RawRule>);

impl Deref for Captures {
    type Target = BTreeMap<usize, RawRule>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Captures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // YAML keys can be plain integers while JSON ones are always strings
        #[derive(Deserialize, PartialEq, Eq, Hash)]
        #[serde(untagged)]
        enum GroupKey {
            Index(usize),
            Name(String),
        }

        // Some grammars write captures as a list, the index being the group number
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Map(HashMap<GroupKey, RawRule>),
            List(Vec<RawRule>),
        }

        let captures = match Shape::deserialize(deserializer)? {
            Shape::Map(map) => map
                .into_iter()
                .filter_map(|(key, rule)| match key {
                    GroupKey::Index(i) => Some((i, rule)),
                    GroupKey::Name(name) => name.trim().parse::<usize>().ok().map(|i| (i, rule)),
                })
                .collect(),
            Shape::List(list) => list.into_iter().enumerate().collect(),
        };
        Ok(Captures(captures))
    }
}

/// `applyEndPatternLast` is written as `1`, `0`, `true` or `false` depending on the grammar
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(i)) => i != 0,
        None => false,
    })
}

/// One rule of a grammar document, in any of its shapes.
///
/// Which fields are set decides the kind of rule:
/// - `include`: a reference to another rule; everything else is ignored
/// - `match`: a single-line rule
/// - `begin` + `end`: a region that can span lines
/// - `begin` + `while`: a region that continues as long as each line matches `while`
/// - only `patterns` (and maybe `repository`): a container of rules
///
/// ```json
/// {
///   "name": "string.quoted.single.apex",
///   "begin": "'",
///   "end": "'",
///   "beginCaptures": { "0": { "name": "punctuation.definition.string.begin.apex" } },
///   "endCaptures": { "0": { "name": "punctuation.definition.string.end.apex" } },
///   "patterns": [{ "include": "#string-character-escape" }]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawRule {
    pub include: Option<String>,
    /// Scope(s) for the whole match or region, space separated
    pub name: Option<String>,
    /// Scope(s) for the text between `begin` and `end`/`while`
    pub content_name: Option<String>,
    #[serde(rename = "match")]
    pub match_: Option<String>,
    /// Fallback for `beginCaptures`/`endCaptures`/`whileCaptures`
    pub captures: Captures,
    pub begin: Option<String>,
    pub begin_captures: Captures,
    pub end: Option<String>,
    pub end_captures: Captures,
    #[serde(rename = "while")]
    pub while_: Option<String>,
    pub while_captures: Captures,
    pub patterns: Vec<RawRule>,
    /// Rules can carry their own repository, visible to their nested patterns only
    pub repository: BTreeMap<String, RepositoryEntry>,
    /// When set, nested patterns get a chance to match before `end` at the same position
    #[serde(deserialize_with = "bool_or_int")]
    pub apply_end_pattern_last: bool,
}

/// Repository values are usually a rule, but a bare list of rules is accepted too.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RepositoryEntry {
    List(Vec<RawRule>),
    Rule(RawRule),
}

impl From<RepositoryEntry> for RawRule {
    fn from(entry: RepositoryEntry) -> Self {
        match entry {
            RepositoryEntry::Rule(rule) => rule,
            RepositoryEntry::List(patterns) => RawRule {
                patterns,
                ..Default::default()
            },
        }
    }
}

/// A grammar document, as found in `.tmLanguage.json` or `.YAML-tmLanguage` files.
///
/// ```yaml
/// name: Apex
/// scopeName: source.apex
/// fileTypes: [cls, trigger]
/// patterns:
///   - include: '#comment'
/// repository:
///   comment:
///     name: comment.line.double-slash.apex
///     match: '//.*$'
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawGrammar {
    /// Human-readable name of the language, the scope name is used if missing
    pub name: String,
    pub display_name: Option<String>,
    pub file_types: Vec<String>,
    /// Unique identifier of the grammar, also the scope of every token, e.g. `source.apex`
    pub scope_name: String,
    pub repository: BTreeMap<String, RepositoryEntry>,
    pub patterns: Vec<RawRule>,
    pub first_line_match: Option<String>,
    /// Selector -> rules evaluated at every position where the selector matches
    pub injections: BTreeMap<String, RepositoryEntry>,
    /// Scope names of the grammars this grammar injects itself into
    pub inject_to: Vec<String>,
    /// Where this grammar gets injected when listed in `inject_to`
    pub injection_selector: Option<String>,
}

impl RawGrammar {
    /// Loads a grammar document, picking the format from the file extension:
    /// `.yaml`/`.yml`/`.YAML-tmLanguage` are YAML, everything else is JSON.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> TintexResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                ext == "yaml" || ext == "yml" || ext == "yaml-tmlanguage"
            });
        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_json_str(content: &str) -> TintexResult<Self> {
        Ok(serde_json::from_str::<Self>(content)?.with_default_name())
    }

    pub fn from_yaml_str(content: &str) -> TintexResult<Self> {
        Ok(serde_yaml::from_str::<Self>(content)?.with_default_name())
    }

    fn with_default_name(mut self) -> Self {
        if self.name.is_empty() {
            self.name = self.scope_name.clone();
        }
        self
    }

    /// The grammar's top level as a rule: its patterns plus its repository
    pub(crate) fn root_rule(&mut self) -> RawRule {
        RawRule {
            patterns: std::mem::take(&mut self.patterns),
            repository: std::mem::take(&mut self.repository),
            ..Default::default()
        }
    }

    /// Compile this raw grammar, validating its regexes and local includes
    pub fn compile(self, id: GrammarId, options: &LoadOptions) -> Result<CompiledGrammar, GrammarError> {
        CompiledGrammar::from_raw_grammar(self, id, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_load_json_grammar() {
        let raw = RawGrammar::from_json_str(
            r##"{
                "scopeName": "source.test",
                "patterns": [
                    { "include": "#kw" },
                    { "begin": "\"", "end": "\"", "applyEndPatternLast": 1, "beginCaptures": { "0": { "name": "punct" } } }
                ],
                "repository": {
                    "kw": { "match": "\\bif\\b", "name": "keyword.control" },
                    "list": [{ "match": "a" }, { "match": "b" }]
                },
                "unknownField": 42
            }"##,
        )
        .unwrap();

        assert_eq!(raw.name, "source.test");
        assert_eq!(raw.patterns.len(), 2);
        assert_eq!(raw.patterns[0].include.as_deref(), Some("#kw"));
        assert!(raw.patterns[1].apply_end_pattern_last);
        assert_eq!(raw.patterns[1].begin_captures[&0].name.as_deref(), Some("punct"));

        let RepositoryEntry::Rule(kw) = &raw.repository["kw"] else {
            panic!("kw should be a rule");
        };
        assert_eq!(kw.match_.as_deref(), Some(r"\bif\b"));
        let list: RawRule = raw.repository["list"].clone().into();
        assert_eq!(list.patterns.len(), 2);
    }

    #[test]
    fn can_load_yaml_grammar() {
        let raw = RawGrammar::from_yaml_str(
            r#"
name: Apex
scopeName: source.apex
patterns:
  - name: comment.line.double-slash.apex
    match: '//.*$'
  - begin: '(\[)'
    end: '\]'
    applyEndPatternLast: true
    captures:
      '1': { name: punctuation.definition.query.begin.apex }
"#,
        )
        .unwrap();
        assert_eq!(raw.name, "Apex");
        assert_eq!(raw.patterns[0].match_.as_deref(), Some("//.*$"));
        assert_eq!(raw.patterns[1].begin.as_deref(), Some(r"(\[)"));
        assert!(raw.patterns[1].apply_end_pattern_last);
        assert_eq!(raw.patterns[1].captures.len(), 1);
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(RawGrammar::from_json_str(r#"{"scopeName": "source.x", "patterns": {}}"#).is_err());
        assert!(RawGrammar::from_yaml_str("patterns: [").is_err());
    }
}
