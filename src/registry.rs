use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, TintexResult};
use crate::grammars::{
    BASE_GLOBAL_RULE_REF, CompiledGrammar, GlobalRuleRef, GrammarError, GrammarId,
    InjectionPrecedence, Match, ROOT_RULE_ID, RawGrammar, Reference, Rule, RuleId,
};
use crate::options::LoadOptions;
use crate::scope::Scope;
use crate::tokenizer::{Token, Tokenizer};

/// The default grammar name, where everything is a single token with the grammar scope
pub const PLAIN_GRAMMAR_NAME: &str = "plain";

static NEXT_REGISTRY_UID: AtomicU64 = AtomicU64::new(1);

fn next_registry_uid() -> u64 {
    NEXT_REGISTRY_UID.fetch_add(1, Ordering::Relaxed)
}

#[inline]
pub(crate) fn normalize_string(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Holds all the grammars and links them together.
///
/// Grammars are added first, then [`Registry::link_grammars`] resolves the includes between
/// them. Once linked, the registry is immutable and can be shared between threads, each
/// tokenizing its own documents.
#[derive(Debug, Serialize, Deserialize)]
pub struct Registry {
    /// Identifies the state stacks created from this registry
    #[serde(skip, default = "next_registry_uid")]
    uid: u64,
    // Vector of compiled grammars for ID-based access
    pub(crate) grammars: Vec<CompiledGrammar>,
    // grammar scope name -> grammar ID, used by includes
    grammar_id_by_scope_name: HashMap<String, GrammarId>,
    // grammar name or alias -> grammar ID, what users ask for
    grammar_id_by_name: HashMap<String, GrammarId>,
    // (grammar, dependency) pairs allowed to be included, by name or scope name
    allowed_includes: HashSet<(String, String)>,
    // Which grammars inject themselves in each grammar with `injectTo`
    injections_by_grammar: Vec<Vec<GrammarId>>,
    #[serde(skip)]
    options: LoadOptions,
    // Once a registry has linked grammars, it's not possible to replace existing grammars.
    linked: bool,
}

/// The id of the grammar added after `count` others. `u16::MAX` is reserved for `$base`.
fn grammar_id_for(count: usize) -> TintexResult<GrammarId> {
    match u16::try_from(count) {
        Ok(id) if id != BASE_GLOBAL_RULE_REF.grammar.0 => Ok(GrammarId(id)),
        _ => Err(Error::TooManyGrammars),
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_options(LoadOptions::default())
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoadOptions) -> Self {
        Self {
            uid: next_registry_uid(),
            grammars: Vec::new(),
            grammar_id_by_scope_name: HashMap::new(),
            grammar_id_by_name: HashMap::new(),
            allowed_includes: HashSet::new(),
            injections_by_grammar: Vec::new(),
            options,
            linked: false,
        }
    }

    pub(crate) fn uid(&self) -> u64 {
        self.uid
    }

    /// Validates and compiles the grammar, adding it under its name and scope name.
    /// A grammar with the same name added earlier is shadowed.
    pub fn add_grammar_from_raw(&mut self, raw_grammar: RawGrammar) -> TintexResult<()> {
        if self.linked && self.grammar_id_by_name.contains_key(&raw_grammar.name) {
            return Err(Error::ReplacingGrammarPostLinking(raw_grammar.name));
        }
        let grammar_id = grammar_id_for(self.grammars.len())?;
        let grammar_name = raw_grammar.name.clone();
        let grammar = raw_grammar
            .compile(grammar_id, &self.options)
            .map_err(|source| Error::InvalidGrammar {
                grammar: grammar_name,
                source,
            })?;

        log::debug!(
            "Loaded grammar {} ({}): {} rules, {} regexes",
            grammar.name,
            grammar.scope_name,
            grammar.rules.len(),
            grammar.regexes.len()
        );

        self.grammar_id_by_scope_name
            .insert(grammar.scope_name.clone(), grammar_id);
        self.grammar_id_by_name
            .insert(grammar.name.clone(), grammar_id);
        self.grammars.push(grammar);
        self.injections_by_grammar.push(Vec::new());
        // the new grammar might need its includes linked
        self.linked = false;
        Ok(())
    }

    /// Reads the file and add it as a grammar, see [`RawGrammar::load_from_file`].
    pub fn add_grammar_from_path(&mut self, path: impl AsRef<Path>) -> TintexResult<()> {
        let raw_grammar = RawGrammar::load_from_file(path)?;
        self.add_grammar_from_raw(raw_grammar)
    }

    /// Adds an empty grammar that will not match any token. Useful as a fallback if the grammar is not found.
    ///
    /// It will get the `plain` grammar name.
    pub fn add_plain_grammar(&mut self, aliases: &[&str]) -> TintexResult<()> {
        let raw = RawGrammar {
            name: PLAIN_GRAMMAR_NAME.to_owned(),
            scope_name: PLAIN_GRAMMAR_NAME.to_owned(),
            ..Default::default()
        };
        self.add_grammar_from_raw(raw)?;
        for alias in aliases {
            self.add_alias(PLAIN_GRAMMAR_NAME, alias);
        }
        Ok(())
    }

    /// Adds an alias for the given grammar
    pub fn add_alias(&mut self, grammar_name: &str, alias: &str) {
        if let Some(grammar_id) = self.grammar_id_by_name.get(grammar_name) {
            self.grammar_id_by_name
                .insert(alias.to_string(), *grammar_id);
        }
    }

    /// Allows `grammar` to include rules from `dependency`. Both can be given by name or
    /// scope name. Must be called before [`Registry::link_grammars`].
    pub fn allow_include(&mut self, grammar: &str, dependency: &str) {
        self.allowed_includes
            .insert((grammar.to_owned(), dependency.to_owned()));
    }

    fn is_include_allowed(&self, grammar: &CompiledGrammar, dependency_scope: &str) -> bool {
        let dependency_name = self
            .grammar_id_by_scope_name
            .get(dependency_scope)
            .map(|id| self.grammars[id.as_index()].name.as_str());
        self.allowed_includes.iter().any(|(g, d)| {
            (*g == grammar.name || *g == grammar.scope_name)
                && (d == dependency_scope || Some(d.as_str()) == dependency_name)
        })
    }

    /// Checks whether the given lang is available in the registry with its grammar name
    /// or aliases
    pub fn contains_grammar(&self, name: &str) -> bool {
        self.grammar_id_by_name.contains_key(name)
    }

    /// Finds a grammar by name, alias or scope name
    pub fn grammar_id(&self, name: &str) -> Option<GrammarId> {
        self.grammar_id_by_name
            .get(name)
            .or_else(|| self.grammar_id_by_scope_name.get(name))
            .copied()
    }

    pub fn grammar(&self, id: GrammarId) -> &CompiledGrammar {
        &self.grammars[id.as_index()]
    }

    pub fn rule(&self, rule_ref: GlobalRuleRef) -> &Rule {
        self.grammar(rule_ref.grammar).rule(rule_ref.rule)
    }

    /// Names of all the grammars, sorted
    pub fn grammar_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.grammars.iter().map(|g| g.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Picks a grammar for a file: first by extension against `fileTypes`, then with the
    /// `firstLineMatch` of each grammar.
    pub fn detect_grammar(&self, file_name: &str, first_line: Option<&str>) -> Option<&str> {
        let file_name = file_name.to_ascii_lowercase();
        let by_file_type = self.grammars.iter().find(|g| {
            g.file_types.iter().any(|ft| {
                let ft = ft.to_ascii_lowercase();
                file_name == ft || file_name.ends_with(&format!(".{ft}"))
            })
        });
        by_file_type
            .or_else(|| {
                let line = first_line?;
                self.grammars.iter().find(|g| g.matches_first_line(line))
            })
            .map(|g| g.name.as_str())
    }

    /// Resolves the includes pointing to other grammars and validates the include chains of
    /// every grammar. Needs to be called after adding grammars and before tokenizing.
    pub fn link_grammars(&mut self) -> TintexResult<()> {
        let mut resolved = Vec::new();

        for grammar in &self.grammars {
            for include in grammar.external_includes() {
                let Reference::External { scope, rule } = &include.reference else {
                    continue;
                };
                let invalid = |source| Error::InvalidGrammar {
                    grammar: grammar.name.clone(),
                    source,
                };
                let dangling = || {
                    invalid(GrammarError::DanglingInclude {
                        rule: grammar.rule_origin(include.id).to_owned(),
                        include: match rule {
                            Some(name) => format!("{scope}#{name}"),
                            None => scope.clone(),
                        },
                    })
                };

                if !self.is_include_allowed(grammar, scope) {
                    return Err(invalid(GrammarError::UndeclaredDependency {
                        grammar: grammar.name.clone(),
                        dependency: scope.clone(),
                    }));
                }
                let dependency_id = *self
                    .grammar_id_by_scope_name
                    .get(scope)
                    .ok_or_else(dangling)?;
                let target = match rule {
                    None => ROOT_RULE_ID,
                    Some(name) => self.grammars[dependency_id.as_index()]
                        .resolve(name)
                        .ok_or_else(dangling)?,
                };
                resolved.push((
                    grammar.id,
                    include.id,
                    GlobalRuleRef {
                        grammar: dependency_id,
                        rule: target,
                    },
                ));
            }
        }

        for (grammar_id, rule_id, target) in resolved {
            self.grammars[grammar_id.as_index()].set_include_target(rule_id, target);
        }

        for injections in &mut self.injections_by_grammar {
            injections.clear();
        }
        for grammar in &self.grammars {
            for inject_to in &grammar.inject_to {
                if let Some(target) = self.grammar_id_by_scope_name.get(inject_to) {
                    let injectors = &mut self.injections_by_grammar[target.as_index()];
                    if !injectors.contains(&grammar.id) {
                        injectors.push(grammar.id);
                    }
                }
            }
        }

        self.check_include_depth()?;
        self.linked = true;
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Every include chain must reach a rule consuming text within `max_include_depth` hops
    fn check_include_depth(&self) -> TintexResult<()> {
        let max_depth = self.options.max_include_depth;
        let mut memo = HashMap::new();
        let mut in_progress = HashSet::new();

        for grammar in &self.grammars {
            for (index, rule) in grammar.rules.iter().enumerate() {
                if !matches!(rule, Rule::Include(_)) {
                    continue;
                }
                let rule_ref = GlobalRuleRef {
                    grammar: grammar.id,
                    rule: RuleId(index as u32),
                };
                if self
                    .include_depth(rule_ref, 0, max_depth, &mut memo, &mut in_progress)
                    .is_none()
                {
                    return Err(Error::InvalidGrammar {
                        grammar: grammar.name.clone(),
                        source: GrammarError::IncludeDepthExceeded {
                            rule: grammar.rule_origin(rule_ref.rule).to_owned(),
                            depth: max_depth,
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// How many includes can be followed in a row from that rule.
    /// `None` when it's more than `max_depth` or infinite.
    fn include_depth(
        &self,
        rule_ref: GlobalRuleRef,
        depth: usize,
        max_depth: usize,
        memo: &mut HashMap<GlobalRuleRef, usize>,
        in_progress: &mut HashSet<GlobalRuleRef>,
    ) -> Option<usize> {
        if let Some(d) = memo.get(&rule_ref) {
            return (depth + d <= max_depth).then_some(*d);
        }
        if depth > max_depth || !in_progress.insert(rule_ref) {
            return None;
        }

        let rule_depth = match self.rule(rule_ref) {
            Rule::Include(include) => match include.target {
                Some(target) if target != BASE_GLOBAL_RULE_REF => {
                    1 + self.include_depth(target, depth + 1, max_depth, memo, in_progress)?
                }
                _ => 1,
            },
            Rule::IncludeOnly(container) => {
                let mut deepest = 0;
                for &child in &container.patterns {
                    let child_ref = GlobalRuleRef {
                        grammar: rule_ref.grammar,
                        rule: child,
                    };
                    deepest = deepest.max(self.include_depth(
                        child_ref,
                        depth,
                        max_depth,
                        memo,
                        in_progress,
                    )?);
                }
                deepest
            }
            _ => 0,
        };

        in_progress.remove(&rule_ref);
        if rule_depth > max_depth {
            return None;
        }
        memo.insert(rule_ref, rule_depth);
        Some(rule_depth)
    }

    /// A tokenizer for the given grammar name, alias or scope name
    pub fn tokenizer(&self, name: &str) -> TintexResult<Tokenizer<'_>> {
        if !self.linked {
            return Err(Error::UnlinkedGrammars);
        }
        let grammar_id = self
            .grammar_id(name)
            .ok_or_else(|| Error::GrammarNotFound(name.to_string()))?;
        Ok(Tokenizer::new(grammar_id, self))
    }

    /// Tokenizes a whole document, one vec of tokens per line
    pub fn tokenize(&self, name: &str, content: &str) -> TintexResult<Vec<Vec<Token>>> {
        self.tokenizer(name)?.tokenize_string(content)
    }

    fn get_rule_patterns<'a>(
        &'a self,
        base_grammar_id: GrammarId,
        mut rule_ref: GlobalRuleRef,
        visited: &mut HashSet<GlobalRuleRef>,
        out: &mut Vec<(GlobalRuleRef, &'a str)>,
    ) {
        if rule_ref == BASE_GLOBAL_RULE_REF {
            rule_ref = GlobalRuleRef {
                grammar: base_grammar_id,
                rule: ROOT_RULE_ID,
            };
        }
        if !visited.insert(rule_ref) {
            return;
        }

        let grammar = self.grammar(rule_ref.grammar);
        match grammar.rule(rule_ref.rule) {
            Rule::Match(Match { regex_id, .. }) => {
                if let Some(regex_id) = regex_id {
                    out.push((rule_ref, grammar.regex(*regex_id).pattern()));
                }
            }
            Rule::BeginEnd(b) => out.push((rule_ref, grammar.regex(b.begin).pattern())),
            Rule::BeginWhile(b) => out.push((rule_ref, grammar.regex(b.begin).pattern())),
            Rule::IncludeOnly(i) => {
                self.get_pattern_set_data(base_grammar_id, rule_ref.grammar, &i.patterns, visited, out);
            }
            Rule::Include(include) => {
                if let Some(target) = include.target {
                    self.get_rule_patterns(base_grammar_id, target, visited, out);
                }
            }
            Rule::Noop => {}
        }
    }

    fn get_pattern_set_data<'a>(
        &'a self,
        base_grammar_id: GrammarId,
        grammar_id: GrammarId,
        rule_ids: &[RuleId],
        visited: &mut HashSet<GlobalRuleRef>,
        out: &mut Vec<(GlobalRuleRef, &'a str)>,
    ) {
        for &rule in rule_ids {
            let rule_ref = GlobalRuleRef {
                grammar: grammar_id,
                rule,
            };
            self.get_rule_patterns(base_grammar_id, rule_ref, visited, out);
        }
    }

    /// The nested patterns of a rule, includes expanded, in declaration order
    pub(crate) fn collect_patterns(
        &self,
        base_grammar_id: GrammarId,
        rule_ref: GlobalRuleRef,
    ) -> Vec<(GlobalRuleRef, &str)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.get_pattern_set_data(
            base_grammar_id,
            rule_ref.grammar,
            self.rule(rule_ref).patterns(),
            &mut visited,
            &mut out,
        );
        out
    }

    /// The patterns of an injected rule: its nested patterns for a container, itself otherwise
    pub(crate) fn collect_injected_patterns(
        &self,
        base_grammar_id: GrammarId,
        rule_ref: GlobalRuleRef,
    ) -> Vec<(GlobalRuleRef, &str)> {
        if matches!(self.rule(rule_ref), Rule::IncludeOnly(_)) {
            return self.collect_patterns(base_grammar_id, rule_ref);
        }
        let mut out = Vec::new();
        self.get_rule_patterns(base_grammar_id, rule_ref, &mut HashSet::new(), &mut out);
        out
    }

    /// The injected rules whose selector matches the current scopes, `L:` ones first and
    /// `R:` ones last.
    pub(crate) fn collect_injection_patterns(
        &self,
        target_grammar_id: GrammarId,
        scope_stack: &[Scope],
    ) -> Vec<(Option<InjectionPrecedence>, GlobalRuleRef)> {
        let mut result = Vec::new();
        let target = self.grammar(target_grammar_id);

        for injection in &target.injections {
            if let Some(matcher) = injection.matchers.iter().find(|m| m.matches(scope_stack)) {
                #[cfg(feature = "debug")]
                log::debug!("Scope stack {scope_stack:?} matched injection selector {matcher:?}");
                result.push((
                    matcher.precedence(),
                    GlobalRuleRef {
                        grammar: target_grammar_id,
                        rule: injection.rule,
                    },
                ));
            }
        }

        // Grammars injecting themselves into the target with `injectTo`
        for &injector_id in &self.injections_by_grammar[target_grammar_id.as_index()] {
            let injector = self.grammar(injector_id);

            if let Some(matcher) = injector
                .injection_selector
                .iter()
                .find(|matcher| matcher.matches(scope_stack))
            {
                result.push((
                    matcher.precedence(),
                    GlobalRuleRef {
                        grammar: injector_id,
                        rule: ROOT_RULE_ID,
                    },
                ));
            }
        }

        // stable so declaration order is kept within a precedence
        result.sort_by_key(|(precedence, _)| match precedence {
            Some(InjectionPrecedence::Left) => -1,
            None => 0,
            Some(InjectionPrecedence::Right) => 1,
        });

        result
    }

    /// Serializes the linked registry to JSON
    pub fn dump_to_json(&self) -> TintexResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads a registry from [`Registry::dump_to_json`] output
    pub fn load_from_json(content: &str) -> TintexResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    #[cfg(feature = "dump")]
    /// Dump the registry to a compressed binary file that can be loaded later
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> TintexResult<()> {
        let data = bitcode::serialize(self)?;
        let compressed = zstd::encode_all(data.as_slice(), 19)?;
        std::fs::write(path, compressed)?;
        Ok(())
    }

    #[cfg(feature = "dump")]
    fn load_from_bytes(compressed_data: &[u8]) -> TintexResult<Self> {
        let data = zstd::decode_all(compressed_data)?;
        Ok(bitcode::deserialize(&data)?)
    }

    #[cfg(feature = "dump")]
    /// Read a binary dump created by [`Registry::dump_to_file`]
    pub fn load_from_file(path: impl AsRef<Path>) -> TintexResult<Self> {
        let compressed_data = std::fs::read(path)?;
        Self::load_from_bytes(&compressed_data)
    }
}
