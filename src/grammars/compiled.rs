use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::grammars::common::{Reference, ScopeName};
use crate::grammars::injections::{InjectionMatcher, parse_injection_selector};
use crate::grammars::raw::{Captures, RawGrammar, RawRule};
use crate::grammars::regex::Regex;
use crate::options::LoadOptions;
use crate::scope::Scope;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl RuleId {
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Deref for RuleId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegexId(u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrammarId(pub u16);

impl GrammarId {
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// The rule holding the top-level patterns of a grammar is always the first one compiled
pub const ROOT_RULE_ID: RuleId = RuleId(0);
/// Stands for the end pattern of the current frame in an eligible rule list
pub const END_RULE_ID: RuleId = RuleId(u32::MAX);

/// A rule in any grammar of a registry
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalRuleRef {
    pub grammar: GrammarId,
    pub rule: RuleId,
}

/// `$base`: only known once we know which grammar started the tokenization
pub const BASE_GLOBAL_RULE_REF: GlobalRuleRef = GlobalRuleRef {
    grammar: GrammarId(u16::MAX),
    rule: ROOT_RULE_ID,
};

/// Name -> rule for one `repository` block
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Repository(BTreeMap<String, RuleId>);

impl Repository {
    pub fn get(&self, name: &str) -> Option<RuleId> {
        self.0.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }
}

/// The repositories visible from a rule, outermost first.
/// Nested repositories shadow the outer ones.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RepositoryStack(Vec<RepositoryId>);

impl RepositoryStack {
    pub fn push(&self, id: RepositoryId) -> Self {
        let mut stack = self.0.clone();
        stack.push(id);
        Self(stack)
    }

    pub fn innermost_first(&self) -> impl Iterator<Item = RepositoryId> + '_ {
        self.0.iter().rev().copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    /// None for scope-only rules, eg a capture only assigning a scope
    pub regex_id: Option<RegexId>,
    pub captures: Vec<Option<RuleId>>,
}

/// A container of patterns: the grammar root, a repository entry with only `patterns`,
/// or a capture with nested patterns.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IncludeOnly {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<RuleId>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BeginEnd {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub end: RegexId,
    pub end_has_backrefs: bool,
    pub end_captures: Vec<Option<RuleId>>,
    pub apply_end_pattern_last: bool,
    pub patterns: Vec<RuleId>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct BeginWhile {
    pub id: RuleId,
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub while_: RegexId,
    pub while_has_backrefs: bool,
    pub while_captures: Vec<Option<RuleId>>,
    pub patterns: Vec<RuleId>,
}

/// An `include`. The target is filled when compiling for references inside the grammar and
/// when linking the registry for references to other grammars.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Include {
    pub id: RuleId,
    pub reference: Reference,
    pub target: Option<GlobalRuleRef>,
    pub repository_stack: RepositoryStack,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Rule {
    Match(Match),
    IncludeOnly(IncludeOnly),
    BeginEnd(BeginEnd),
    BeginWhile(BeginWhile),
    Include(Include),
    Noop,
}

impl Rule {
    /// Nested patterns, active while a frame of that rule is on the stack
    pub fn patterns(&self) -> &[RuleId] {
        match self {
            Rule::IncludeOnly(r) => &r.patterns,
            Rule::BeginEnd(r) => &r.patterns,
            Rule::BeginWhile(r) => &r.patterns,
            Rule::Match(_) | Rule::Include(_) | Rule::Noop => &[],
        }
    }

    pub fn has_patterns(&self) -> bool {
        !self.patterns().is_empty()
    }

    fn name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.name.as_ref(),
            Rule::IncludeOnly(r) => r.name.as_ref(),
            Rule::BeginEnd(r) => r.name.as_ref(),
            Rule::BeginWhile(r) => r.name.as_ref(),
            Rule::Include(_) | Rule::Noop => None,
        }
    }

    fn content_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::IncludeOnly(r) => r.content_name.as_ref(),
            Rule::BeginEnd(r) => r.content_name.as_ref(),
            Rule::BeginWhile(r) => r.content_name.as_ref(),
            Rule::Match(_) | Rule::Include(_) | Rule::Noop => None,
        }
    }

    /// Scopes from `name`, applied to the whole match including delimiters
    pub fn name_scopes(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        self.name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }

    /// Scopes from `contentName`, applied between the delimiters
    pub fn content_scopes(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        self.content_name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }

    pub fn original_name(&self) -> Option<&str> {
        self.name().map(|n| n.raw())
    }
}

/// Rules injected wherever their selector matches the current scopes
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub matchers: Vec<InjectionMatcher>,
    pub rule: RuleId,
}

/// Regexes built at runtime from end/while patterns with backreferences substituted.
/// Shared by every tokenizer using the grammar.
#[derive(Default)]
pub struct RegexCache(papaya::HashMap<String, Arc<Regex>>);

impl RegexCache {
    pub fn get_or_create(&self, pattern: &str) -> Arc<Regex> {
        let map = self.0.pin();
        if let Some(re) = map.get(pattern) {
            return Arc::clone(re);
        }
        let re = Arc::new(Regex::new(pattern.to_owned()));
        map.insert(pattern.to_owned(), Arc::clone(&re));
        re
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for RegexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegexCache({} entries)", self.len())
    }
}

/// The rule repository of one grammar: every rule in an arena addressed by [`RuleId`], the
/// regexes they use and the named repositories.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompiledGrammar {
    pub id: GrammarId,
    pub name: String,
    pub display_name: Option<String>,
    pub scope_name: String,
    pub scope: Scope,
    pub file_types: Vec<String>,
    pub first_line_match: Option<Regex>,
    pub regexes: Vec<Regex>,
    pub rules: Vec<Rule>,
    /// Where each rule comes from in the document, eg `repository.string.patterns[1]`
    rule_origins: Vec<String>,
    pub repositories: Vec<Repository>,
    root_repository: Option<RepositoryId>,
    pub injections: Vec<Injection>,
    pub inject_to: Vec<String>,
    pub injection_selector: Vec<InjectionMatcher>,
    #[serde(skip)]
    dynamic_regexes: RegexCache,
}

impl CompiledGrammar {
    pub fn from_raw_grammar(
        mut raw: RawGrammar,
        id: GrammarId,
        options: &LoadOptions,
    ) -> Result<Self, GrammarError> {
        if raw.scope_name.trim().is_empty() {
            return Err(GrammarError::MissingScopeName);
        }

        let mut grammar = Self {
            id,
            name: raw.name.clone(),
            display_name: raw.display_name.clone(),
            scope: Scope::new(&raw.scope_name),
            scope_name: raw.scope_name.clone(),
            file_types: raw.file_types.clone(),
            first_line_match: None,
            regexes: Vec::new(),
            rules: Vec::new(),
            rule_origins: Vec::new(),
            repositories: Vec::new(),
            root_repository: None,
            injections: Vec::new(),
            inject_to: raw.inject_to.clone(),
            injection_selector: raw
                .injection_selector
                .as_deref()
                .map(parse_injection_selector)
                .unwrap_or_default(),
            dynamic_regexes: RegexCache::default(),
        };

        let mut compiler = Compiler {
            grammar: &mut grammar,
            validate: options.validate_regexes,
        };

        let root_rule = raw.root_rule();
        let has_root_repository = !root_rule.repository.is_empty();
        let root_rule_id =
            compiler.compile_rule(root_rule, &RepositoryStack::default(), "patterns")?;
        debug_assert_eq!(root_rule_id, ROOT_RULE_ID);

        // The root repository is the first one compiled
        let root_stack = if has_root_repository {
            compiler.grammar.root_repository = Some(RepositoryId(0));
            RepositoryStack::default().push(RepositoryId(0))
        } else {
            RepositoryStack::default()
        };

        for (selector, entry) in std::mem::take(&mut raw.injections) {
            let origin = format!("injections[{selector:?}]");
            let rule = compiler.compile_rule(entry.into(), &root_stack, &origin)?;
            compiler.grammar.injections.push(Injection {
                matchers: parse_injection_selector(&selector),
                rule,
            });
        }

        if let Some(pattern) = raw.first_line_match.take() {
            let re = Regex::new(pattern);
            if compiler.validate {
                re.validate().map_err(|message| GrammarError::InvalidRegex {
                    rule: "firstLineMatch".to_owned(),
                    pattern: re.pattern().to_owned(),
                    message,
                })?;
            }
            compiler.grammar.first_line_match = Some(re);
        }

        grammar.resolve_local_includes()?;
        Ok(grammar)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.as_index()]
    }

    pub fn regex(&self, id: RegexId) -> &Regex {
        &self.regexes[id.0 as usize]
    }

    /// Where the rule was defined in the grammar document
    pub fn rule_origin(&self, id: RuleId) -> &str {
        self.rule_origins
            .get(id.as_index())
            .map(|s| s.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn root_repository(&self) -> Option<&Repository> {
        self.root_repository
            .map(|id| &self.repositories[id.0 as usize])
    }

    /// Looks up a rule from the grammar top level: `$self`, `#name` or `name`.
    pub fn resolve(&self, name: &str) -> Option<RuleId> {
        match name {
            "$self" => Some(ROOT_RULE_ID),
            _ => self
                .root_repository()?
                .get(name.strip_prefix('#').unwrap_or(name)),
        }
    }

    /// Whether this grammar claims the given first line, eg a shebang
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_match.as_ref().is_some_and(|re| {
            re.find_at(line, 0, crate::tokenizer::anchors::AnchorActive::AG)
                .is_some()
        })
    }

    /// Compiled end/while regex once backreferences have been filled
    pub(crate) fn dynamic_regex(&self, pattern: &str) -> Arc<Regex> {
        self.dynamic_regexes.get_or_create(pattern)
    }

    fn lookup_local(&self, stack: &RepositoryStack, name: &str) -> Option<RuleId> {
        stack
            .innermost_first()
            .find_map(|repo| self.repositories[repo.0 as usize].get(name))
    }

    /// Fills the target of every include pointing inside this grammar. Includes of other
    /// grammars are left to the registry.
    fn resolve_local_includes(&mut self) -> Result<(), GrammarError> {
        let mut resolved = Vec::new();

        for rule in &self.rules {
            let Rule::Include(include) = rule else {
                continue;
            };
            let target = match &include.reference {
                Reference::Self_ => Some(ROOT_RULE_ID),
                Reference::Base => {
                    resolved.push((include.id, BASE_GLOBAL_RULE_REF));
                    continue;
                }
                Reference::Local(name) => Some(
                    self.lookup_local(&include.repository_stack, name)
                        .ok_or_else(|| GrammarError::DanglingInclude {
                            rule: self.rule_origin(include.id).to_owned(),
                            include: format!("#{name}"),
                        })?,
                ),
                Reference::External { scope, rule } if *scope == self.scope_name => match rule {
                    None => Some(ROOT_RULE_ID),
                    Some(name) => Some(self.resolve(name).ok_or_else(|| {
                        GrammarError::DanglingInclude {
                            rule: self.rule_origin(include.id).to_owned(),
                            include: format!("{scope}#{name}"),
                        }
                    })?),
                },
                Reference::External { .. } => None,
            };
            if let Some(target) = target {
                resolved.push((
                    include.id,
                    GlobalRuleRef {
                        grammar: self.id,
                        rule: target,
                    },
                ));
            }
        }

        for (id, target) in resolved {
            self.set_include_target(id, target);
        }
        Ok(())
    }

    pub(crate) fn set_include_target(&mut self, id: RuleId, target: GlobalRuleRef) {
        if let Rule::Include(include) = &mut self.rules[id.as_index()] {
            include.target = Some(target);
        }
    }

    /// Includes that point to other grammars and are not linked yet
    pub(crate) fn external_includes(&self) -> impl Iterator<Item = &Include> {
        self.rules.iter().filter_map(|r| match r {
            Rule::Include(include) if include.target.is_none() => Some(include),
            _ => None,
        })
    }
}

/// Turns raw rules into arena entries for one grammar
struct Compiler<'g> {
    grammar: &'g mut CompiledGrammar,
    validate: bool,
}

impl Compiler<'_> {
    fn compile_rule(
        &mut self,
        raw_rule: RawRule,
        repository_stack: &RepositoryStack,
        origin: &str,
    ) -> Result<RuleId, GrammarError> {
        let id = RuleId(self.grammar.rules.len() as u32);

        // push a no-op to reserve its spot
        self.grammar.rules.push(Rule::Noop);
        self.grammar.rule_origins.push(origin.to_owned());

        // vscode ignores the rest of a rule when there's an include
        if let Some(include) = raw_rule.include {
            self.grammar.rules[id.as_index()] = Rule::Include(Include {
                id,
                reference: include.as_str().into(),
                target: None,
                repository_stack: repository_stack.clone(),
            });
            return Ok(id);
        }

        let repository_stack = if raw_rule.repository.is_empty() {
            repository_stack.clone()
        } else {
            let repo_id = self.compile_repository(raw_rule.repository, repository_stack, origin)?;
            repository_stack.push(repo_id)
        };
        let name = raw_rule.name.map(ScopeName::new);
        let content_name = raw_rule.content_name.map(ScopeName::new);

        let rule = if let Some(pat) = raw_rule.match_ {
            let captures = self.compile_captures(raw_rule.captures, &repository_stack, origin, "captures")?;
            Rule::Match(Match {
                id,
                name,
                regex_id: Some(self.compile_regex(pat, origin)?.0),
                captures,
            })
        } else if let Some(begin_pat) = raw_rule.begin {
            let begin = self.compile_regex(begin_pat, origin)?.0;
            let begin_captures = if raw_rule.begin_captures.is_empty() {
                &raw_rule.captures
            } else {
                &raw_rule.begin_captures
            };
            let begin_captures = self.compile_captures(
                begin_captures.clone(),
                &repository_stack,
                origin,
                "beginCaptures",
            )?;

            if let Some(while_pat) = raw_rule.while_ {
                let (while_, while_has_backrefs) = self.compile_regex(while_pat, origin)?;
                let while_captures = if raw_rule.while_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.while_captures
                };
                Rule::BeginWhile(BeginWhile {
                    id,
                    name,
                    content_name,
                    begin,
                    begin_captures,
                    while_,
                    while_has_backrefs,
                    while_captures: self.compile_captures(
                        while_captures,
                        &repository_stack,
                        origin,
                        "whileCaptures",
                    )?,
                    patterns: self.compile_patterns(raw_rule.patterns, &repository_stack, origin)?,
                })
            } else if let Some(end_pat) = raw_rule.end {
                let (end, end_has_backrefs) = self.compile_regex(end_pat, origin)?;
                let end_captures = if raw_rule.end_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.end_captures
                };
                Rule::BeginEnd(BeginEnd {
                    id,
                    name,
                    content_name,
                    begin,
                    begin_captures,
                    end,
                    end_has_backrefs,
                    end_captures: self.compile_captures(
                        end_captures,
                        &repository_stack,
                        origin,
                        "endCaptures",
                    )?,
                    apply_end_pattern_last: raw_rule.apply_end_pattern_last,
                    patterns: self.compile_patterns(raw_rule.patterns, &repository_stack, origin)?,
                })
            } else {
                // a rule that has begin without while/end is just a match, probably a typo
                Rule::Match(Match {
                    id,
                    name,
                    regex_id: Some(begin),
                    captures: begin_captures,
                })
            }
        } else if raw_rule.patterns.is_empty() {
            if name.is_some() {
                // Scope-only rule, eg a capture that only assigns a scope
                Rule::Match(Match {
                    id,
                    name,
                    regex_id: None,
                    captures: Vec::new(),
                })
            } else {
                Rule::Noop
            }
        } else {
            Rule::IncludeOnly(IncludeOnly {
                id,
                name,
                content_name,
                patterns: self.compile_patterns(raw_rule.patterns, &repository_stack, origin)?,
            })
        };

        self.grammar.rules[id.as_index()] = rule;
        Ok(id)
    }

    fn compile_regex(&mut self, pattern: String, origin: &str) -> Result<(RegexId, bool), GrammarError> {
        let regex_id = RegexId(self.grammar.regexes.len() as u32);
        let re = Regex::new(pattern);
        if self.validate {
            re.validate().map_err(|message| GrammarError::InvalidRegex {
                rule: origin.to_owned(),
                pattern: re.pattern().to_owned(),
                message,
            })?;
        }
        let has_backrefs = re.has_backreferences();
        self.grammar.regexes.push(re);

        Ok((regex_id, has_backrefs))
    }

    fn compile_repository(
        &mut self,
        raw_repository: BTreeMap<String, crate::grammars::raw::RepositoryEntry>,
        repository_stack: &RepositoryStack,
        origin: &str,
    ) -> Result<RepositoryId, GrammarError> {
        let repo_id = RepositoryId(self.grammar.repositories.len() as u32);

        self.grammar.repositories.push(Repository::default());
        let stack = repository_stack.push(repo_id);
        let prefix = if origin == "patterns" {
            "repository".to_owned()
        } else {
            format!("{origin}.repository")
        };

        let mut rules = BTreeMap::new();
        for (name, entry) in raw_repository {
            let rule_origin = format!("{prefix}.{name}");
            rules.insert(name, self.compile_rule(entry.into(), &stack, &rule_origin)?);
        }

        self.grammar.repositories[repo_id.0 as usize] = Repository(rules);

        Ok(repo_id)
    }

    fn compile_captures(
        &mut self,
        captures: Captures,
        repository_stack: &RepositoryStack,
        origin: &str,
        kind: &str,
    ) -> Result<Vec<Option<RuleId>>, GrammarError> {
        if captures.is_empty() {
            return Ok(Vec::new());
        }

        let max_capture = captures.keys().max().copied().unwrap_or_default();
        let mut out: Vec<Option<RuleId>> = vec![None; max_capture + 1];

        for (key, rule) in captures.0 {
            let capture_origin = format!("{origin}.{kind}[{key}]");
            out[key] = Some(self.compile_rule(rule, repository_stack, &capture_origin)?);
        }

        Ok(out)
    }

    fn compile_patterns(
        &mut self,
        rules: Vec<RawRule>,
        repository_stack: &RepositoryStack,
        origin: &str,
    ) -> Result<Vec<RuleId>, GrammarError> {
        let mut out = Vec::with_capacity(rules.len());
        for (i, r) in rules.into_iter().enumerate() {
            let pattern_origin = if origin == "patterns" {
                format!("patterns[{i}]")
            } else {
                format!("{origin}.patterns[{i}]")
            };
            out.push(self.compile_rule(r, repository_stack, &pattern_origin)?);
        }
        Ok(out)
    }
}

/// Errors that make a grammar unusable. They are all detected when loading or linking.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GrammarError {
    /// The document has no `scopeName`
    MissingScopeName,
    InvalidRegex {
        rule: String,
        pattern: String,
        message: String,
    },
    /// An include pointing to a rule or grammar that doesn't exist
    DanglingInclude { rule: String, include: String },
    /// Following includes from that rule never reaches a rule that consumes text
    IncludeDepthExceeded { rule: String, depth: usize },
    /// An include of another grammar that was not allowed with `Registry::allow_include`
    UndeclaredDependency { grammar: String, dependency: String },
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::MissingScopeName => write!(f, "grammar has no scopeName"),
            GrammarError::InvalidRegex {
                rule,
                pattern,
                message,
            } => write!(f, "invalid regex '{pattern}' in {rule}: {message}"),
            GrammarError::DanglingInclude { rule, include } => {
                write!(f, "unresolved include '{include}' in {rule}")
            }
            GrammarError::IncludeDepthExceeded { rule, depth } => write!(
                f,
                "include chain starting at {rule} is deeper than {depth} (recursive includes?)"
            ),
            GrammarError::UndeclaredDependency {
                grammar,
                dependency,
            } => write!(
                f,
                "grammar '{grammar}' includes '{dependency}' which was not declared as a dependency"
            ),
        }
    }
}

impl std::error::Error for GrammarError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(json: &str) -> Result<CompiledGrammar, GrammarError> {
        RawGrammar::from_json_str(json)
            .unwrap()
            .compile(GrammarId(0), &LoadOptions::default())
    }

    #[test]
    fn compiles_every_kind_of_rule() {
        let grammar = compile(
            r##"{
                "scopeName": "source.test",
                "patterns": [
                    { "include": "#string" },
                    { "match": "\\d+", "name": "constant.numeric" },
                    { "begin": "^>", "while": "^>", "name": "markup.quote" }
                ],
                "repository": {
                    "string": {
                        "begin": "(['\"])", "end": "\\1", "name": "string.quoted",
                        "patterns": [{ "match": "\\\\.", "name": "constant.character.escape" }]
                    }
                }
            }"##,
        )
        .unwrap();

        let Rule::IncludeOnly(root) = grammar.rule(ROOT_RULE_ID) else {
            panic!("root should be a container");
        };
        assert_eq!(root.patterns.len(), 3);
        assert!(matches!(grammar.rule(root.patterns[0]), Rule::Include(_)));
        assert!(matches!(grammar.rule(root.patterns[1]), Rule::Match(_)));
        assert!(matches!(grammar.rule(root.patterns[2]), Rule::BeginWhile(_)));

        let string_id = grammar.resolve("#string").unwrap();
        let Rule::BeginEnd(string) = grammar.rule(string_id) else {
            panic!("string should be begin/end");
        };
        assert!(string.end_has_backrefs);
        assert_eq!(string.patterns.len(), 1);
        assert_eq!(grammar.rule_origin(string_id), "repository.string");

        let Rule::Include(include) = grammar.rule(root.patterns[0]) else {
            unreachable!()
        };
        assert_eq!(
            include.target,
            Some(GlobalRuleRef {
                grammar: GrammarId(0),
                rule: string_id
            })
        );
    }

    #[test]
    fn nested_repositories_shadow_outer_ones() {
        let grammar = compile(
            r##"{
                "scopeName": "source.test",
                "patterns": [{ "include": "#block" }, { "include": "#word" }],
                "repository": {
                    "word": { "match": "outer", "name": "outer" },
                    "block": {
                        "begin": "\\{", "end": "\\}",
                        "patterns": [{ "include": "#word" }],
                        "repository": { "word": { "match": "inner", "name": "inner" } }
                    }
                }
            }"##,
        )
        .unwrap();
        let Rule::BeginEnd(block) = grammar.rule(grammar.resolve("block").unwrap()) else {
            panic!("block should be begin/end");
        };
        let Rule::Include(include) = grammar.rule(block.patterns[0]) else {
            panic!("expected an include");
        };
        let target = include.target.unwrap().rule;
        assert_eq!(grammar.rule(target).original_name(), Some("inner"));
        assert_eq!(grammar.rule(grammar.resolve("word").unwrap()).original_name(), Some("outer"));
    }

    #[test]
    fn rejects_invalid_regex_with_rule_name() {
        let err = compile(
            r#"{ "scopeName": "source.test", "repository": { "bad": { "match": "(oops" } } }"#,
        )
        .unwrap_err();
        let GrammarError::InvalidRegex { rule, pattern, .. } = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(rule, "repository.bad");
        assert_eq!(pattern, "(oops");
    }

    #[test]
    fn regex_validation_can_be_disabled() {
        let raw = RawGrammar::from_json_str(
            r#"{ "scopeName": "source.test", "patterns": [{ "match": "(oops" }] }"#,
        )
        .unwrap();
        assert!(
            raw.compile(GrammarId(0), &LoadOptions::default().validate_regexes(false))
                .is_ok()
        );
    }

    #[test]
    fn rejects_dangling_local_include() {
        let err = compile(
            r##"{ "scopeName": "source.test", "patterns": [{ "match": "a" }, { "include": "#missing" }] }"##,
        )
        .unwrap_err();
        assert_eq!(
            err,
            GrammarError::DanglingInclude {
                rule: "patterns[1]".to_owned(),
                include: "#missing".to_owned()
            }
        );
    }

    #[test]
    fn own_scope_name_is_a_self_reference() {
        let grammar = compile(
            r#"{ "scopeName": "source.test", "patterns": [{ "include": "source.test" }, { "include": "source.other" }] }"#,
        )
        .unwrap();
        let externals: Vec<_> = grammar.external_includes().collect();
        assert_eq!(externals.len(), 1);
        assert_eq!(
            externals[0].reference,
            Reference::External {
                scope: "source.other".to_owned(),
                rule: None
            }
        );
    }

    #[test]
    fn rejects_missing_scope_name() {
        assert_eq!(
            compile(r#"{ "name": "nothing" }"#).unwrap_err(),
            GrammarError::MissingScopeName
        );
    }

    #[test]
    fn captures_fall_back_to_generic_captures() {
        let grammar = compile(
            r#"{
                "scopeName": "source.test",
                "patterns": [{
                    "begin": "(<)", "end": "(>)",
                    "captures": { "1": { "name": "punctuation" } }
                }]
            }"#,
        )
        .unwrap();
        let Rule::BeginEnd(rule) = grammar.rule(grammar.rule(ROOT_RULE_ID).patterns()[0]) else {
            panic!("expected begin/end");
        };
        assert_eq!(rule.begin_captures.len(), 2);
        assert_eq!(rule.end_captures.len(), 2);
        assert!(rule.begin_captures[1].is_some());
    }
}
