//! The line tokenizer, following the logic of <https://github.com/microsoft/vscode-textmate>

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::Registry;
use crate::error::{Error, TintexResult};
use crate::grammars::{
    CapturePositions, END_RULE_ID, GlobalRuleRef, GrammarId, InjectionPrecedence, PatternSet,
    PatternSetMatch, RegexId, Rule, RuleId, resolve_backreferences,
};
use crate::registry::normalize_string;
use crate::scope::Scope;
use crate::tokenizer::anchors::AnchorActive;

pub(crate) mod anchors;
mod stack;

pub use stack::{StackFrame, StateStack};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Byte span within the line (start inclusive, end exclusive, 0-based)
    pub span: Range<usize>,
    /// Hierarchical scope names, ordered from outermost to innermost
    /// (e.g., source.apex -> string.quoted.single.apex -> punctuation.definition.string.begin.apex).
    pub scopes: Vec<Scope>,
}

/// The tokens of one line and the state to give back for the next line
#[derive(Debug, Clone, PartialEq)]
pub struct LineTokens {
    pub tokens: Vec<Token>,
    pub state: StateStack,
}

/// Makes sure tokens are contiguous and never empty
#[derive(Debug, Clone, Default)]
struct TokenAccumulator {
    tokens: Vec<Token>,
    /// Start of the next token to be produced
    last_end_pos: usize,
}

impl TokenAccumulator {
    fn new(start: usize) -> Self {
        Self {
            tokens: Vec::new(),
            last_end_pos: start,
        }
    }

    fn produce(&mut self, end_pos: usize, scopes: &[Scope]) {
        // Skip empty tokens (can happen with zero-width matches)
        if self.last_end_pos >= end_pos {
            return;
        }

        #[cfg(feature = "debug")]
        log::debug!(
            "[produce]: [{}..{end_pos}] {}",
            self.last_end_pos,
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.tokens.push(Token {
            span: self.last_end_pos..end_pos,
            scopes: scopes.to_vec(),
        });
        self.last_end_pos = end_pos;
    }

    /// Drops what was produced for the `\n` we add to every line
    fn finalize(mut self, line_len: usize) -> Vec<Token> {
        self.tokens.retain(|t| t.span.start < line_len);
        if let Some(t) = self.tokens.last_mut()
            && t.span.end > line_len
        {
            t.span.end = line_len;
        }
        self.tokens
    }
}

/// Where the byte after the char at `pos` is, used to force progress
fn next_char_boundary(line: &str, pos: usize) -> usize {
    let len = line[pos..].chars().next().map_or(1, char::len_utf8);
    (pos + len).min(line.len())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternSetKey {
    rule_ref: GlobalRuleRef,
    /// Only set when the end pattern had backreferences
    end_pattern: Option<String>,
    anchors: AnchorActive,
    injected: bool,
}

/// Tokenizes lines of one grammar.
///
/// A tokenizer is cheap to create and keeps a cache of compiled pattern sets, keep it around
/// for the whole document. It is not `Sync`: use one per thread, the registry can be shared.
#[derive(Debug)]
pub struct Tokenizer<'r> {
    /// The grammar we start with, also what `$base` points to
    base_grammar_id: GrammarId,
    registry: &'r Registry,
    pattern_cache: HashMap<PatternSetKey, PatternSet>,
}

impl<'r> Tokenizer<'r> {
    pub(crate) fn new(base_grammar_id: GrammarId, registry: &'r Registry) -> Self {
        Self {
            base_grammar_id,
            registry,
            pattern_cache: HashMap::new(),
        }
    }

    /// The state before the first line of a document
    pub fn initial_state(&self) -> StateStack {
        StateStack::new(
            self.registry.uid(),
            self.base_grammar_id,
            self.registry.grammar(self.base_grammar_id).scope.clone(),
        )
    }

    /// Tokenizes a single line, without its line terminator.
    ///
    /// `previous` is the state returned for the previous line, `None` for the first line of a
    /// document. Errors if the state comes from another registry or grammar.
    pub fn tokenize_line(
        &mut self,
        line: &str,
        previous: Option<&StateStack>,
    ) -> TintexResult<LineTokens> {
        let stack = match previous {
            Some(state) => {
                if state.registry_uid != self.registry.uid()
                    || state.base_grammar != self.base_grammar_id
                {
                    return Err(Error::ForeignState);
                }
                state.clone()
            }
            None => self.initial_state(),
        };
        let is_first_line = stack.at_document_start;

        // Always add a new line, some regex expect it
        let line_with_newline = format!("{line}\n");
        let (acc, mut state) = self.tokenize_from(stack, &line_with_newline, 0, is_first_line, true);
        state.reset();
        state.at_document_start = false;

        Ok(LineTokens {
            tokens: acc.finalize(line.len()),
            state,
        })
    }

    /// Tokenizes a whole document: `\r\n` and `\r` are treated as `\n`.
    /// An empty text has no lines.
    pub fn tokenize_string(&mut self, text: &str) -> TintexResult<Vec<Vec<Token>>> {
        if text.is_empty() {
            return Ok(vec![]);
        }

        let text = normalize_string(text);
        let mut state: Option<StateStack> = None;
        let mut lines_tokens = Vec::new();

        for line in text.split('\n') {
            let line_tokens = self.tokenize_line(line, state.as_ref())?;
            lines_tokens.push(line_tokens.tokens);
            state = Some(line_tokens.state);
        }

        Ok(lines_tokens)
    }

    fn pattern_set(&mut self, key: PatternSetKey, stack: &StateStack) -> &PatternSet {
        let registry = self.registry;
        let base_grammar_id = self.base_grammar_id;

        self.pattern_cache.entry(key).or_insert_with_key(|key| {
            let patterns = if key.injected {
                registry
                    .collect_injected_patterns(base_grammar_id, key.rule_ref)
                    .into_iter()
                    .map(|(rule_ref, pat)| (rule_ref, pat.to_owned()))
                    .collect()
            } else {
                stack.eligible_rules(registry)
            };

            #[cfg(feature = "debug")]
            log::debug!(
                "[pattern_set] {} patterns for {:?} (anchors {:?})",
                patterns.len(),
                key.rule_ref,
                key.anchors
            );

            PatternSet::new(
                patterns
                    .into_iter()
                    .map(|(rule_ref, pat)| {
                        let pat = key.anchors.replace_anchors(&pat).into_owned();
                        (rule_ref, pat)
                    })
                    .collect(),
            )
        })
    }

    /// Finds the best match among the injections whose selector matches the current scopes
    fn match_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> Option<(Option<InjectionPrecedence>, PatternSetMatch)> {
        let injections = self
            .registry
            .collect_injection_patterns(self.base_grammar_id, &stack.top().content_scopes);

        let mut best_match: Option<(Option<InjectionPrecedence>, PatternSetMatch)> = None;

        // sorted by precedence already, the first one keeps ties
        for (precedence, rule_ref) in injections {
            let key = PatternSetKey {
                rule_ref,
                end_pattern: None,
                anchors,
                injected: true,
            };
            let Some(found) = self.pattern_set(key, stack).find_at(line, pos) else {
                continue;
            };
            if best_match
                .as_ref()
                .is_some_and(|(_, best)| best.start <= found.start)
            {
                continue;
            }
            let is_done = found.start == pos;
            best_match = Some((precedence, found));
            if is_done {
                break;
            }
        }

        best_match
    }

    /// Matches both the current frame rules and the injections.
    /// Injections win if they match earlier, or at the same position with `L:` precedence.
    fn match_rule_or_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> Option<PatternSetMatch> {
        let top = stack.top();
        let key = PatternSetKey {
            rule_ref: top.rule_ref,
            end_pattern: top.end_pattern.clone(),
            anchors,
            injected: false,
        };
        let regular_match = self.pattern_set(key, stack).find_at(line, pos);
        let injection_match = self.match_injections(stack, line, pos, anchors);

        match (regular_match, injection_match) {
            (None, None) => None,
            (Some(regular), None) => Some(regular),
            (None, Some((_, injection))) => Some(injection),
            (Some(regular), Some((precedence, injection))) => {
                if injection.start < regular.start
                    || (injection.start == regular.start
                        && precedence == Some(InjectionPrecedence::Left))
                {
                    Some(injection)
                } else {
                    Some(regular)
                }
            }
        }
    }

    /// Checks the while patterns of the active begin/while frames at the start of the line,
    /// outermost first. The first one failing pops its frame and everything above it.
    /// Returns the anchor position and whether we're still on the first line.
    fn check_while_conditions(
        &mut self,
        stack: &mut StateStack,
        line: &str,
        pos: &mut usize,
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) -> (Option<usize>, bool) {
        let mut anchor_position = if stack.top().begin_rule_has_captured_eol {
            Some(0)
        } else {
            None
        };
        let mut is_first_line = is_first_line;
        let registry = self.registry;

        let while_frames: Vec<usize> = stack
            .frames()
            .enumerate()
            .filter(|(_, frame)| matches!(registry.rule(frame.rule_ref), Rule::BeginWhile(_)))
            .map(|(depth, _)| depth)
            .collect();

        for depth in while_frames {
            let Some(frame) = stack.frames().nth(depth).cloned() else {
                break;
            };
            let grammar = registry.grammar(frame.rule_ref.grammar);
            let Rule::BeginWhile(rule) = grammar.rule(frame.rule_ref.rule) else {
                continue;
            };
            let anchors = AnchorActive::new(is_first_line, anchor_position, *pos);
            let found = match &frame.end_pattern {
                Some(pattern) => grammar.dynamic_regex(pattern).find_at(line, *pos, anchors),
                None => grammar.regex(rule.while_).find_at(line, *pos, anchors),
            };

            match found {
                Some(captures)
                    if captures
                        .first()
                        .copied()
                        .flatten()
                        .is_some_and(|(start, _)| start == *pos) =>
                {
                    let end = captures[0].map_or(*pos, |(_, e)| e);
                    #[cfg(feature = "debug")]
                    log::debug!(
                        "[check_while_conditions] {:?} still holds until {end}",
                        rule.name.as_ref().map(|n| n.raw())
                    );

                    acc.produce(*pos, &frame.content_scopes);
                    if !rule.while_captures.is_empty() {
                        let mut while_stack = stack.clone();
                        while_stack.truncate(depth + 1);
                        self.resolve_captures(
                            &while_stack,
                            line,
                            frame.rule_ref.grammar,
                            &rule.while_captures,
                            &captures,
                            acc,
                            is_first_line,
                        );
                    }
                    acc.produce(end, &frame.content_scopes);

                    if end > *pos {
                        *pos = end;
                        anchor_position = Some(end);
                        is_first_line = false;
                    }
                }
                _ => {
                    #[cfg(feature = "debug")]
                    log::debug!(
                        "[check_while_conditions] {:?} no longer holds, popping",
                        rule.name.as_ref().map(|n| n.raw())
                    );
                    stack.truncate(depth);
                    break;
                }
            }
        }

        (anchor_position, is_first_line)
    }

    /// Produces the tokens of the capture groups. Groups are layered over each other in
    /// group order, groups with patterns get their text tokenized again with them.
    #[allow(clippy::too_many_arguments)]
    fn resolve_captures(
        &mut self,
        stack: &StateStack,
        line: &str,
        grammar_id: GrammarId,
        rule_captures: &[Option<RuleId>],
        captures: &CapturePositions,
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) {
        if rule_captures.is_empty() {
            return;
        }

        // (scopes, end_pos) of the captures we are in
        let mut local_stack: Vec<(Vec<Scope>, usize)> = Vec::with_capacity(2);
        let registry = self.registry;
        let grammar = registry.grammar(grammar_id);

        for (i, capture_rule) in rule_captures.iter().enumerate() {
            let Some(capture_rule) = capture_rule else {
                continue;
            };
            let Some(Some((cap_start, cap_end))) = captures.get(i).copied() else {
                continue;
            };
            // Nothing captured
            if cap_start == cap_end {
                continue;
            }

            while let Some((scopes, end_pos)) = local_stack.last()
                && *end_pos <= cap_start
            {
                acc.produce(*end_pos, scopes);
                local_stack.pop();
            }

            let base_scopes = local_stack
                .last()
                .map(|(scopes, _)| scopes.clone())
                .unwrap_or_else(|| stack.top().content_scopes.clone());
            acc.produce(cap_start, &base_scopes);

            let rule_ref = GlobalRuleRef {
                grammar: grammar_id,
                rule: *capture_rule,
            };
            let rule = grammar.rule(*capture_rule);

            // A capture whose patterns match the same text again would recurse forever
            if rule.has_patterns() && !stack.has_rule_entered_at(rule_ref, cap_start) {
                let mut name_scopes = base_scopes;
                name_scopes.extend(rule.name_scopes(line, captures));
                let mut content_scopes = name_scopes.clone();
                content_scopes.extend(rule.content_scopes(line, captures));

                let mut retokenization_stack = stack.clone();
                retokenization_stack.push(StackFrame {
                    rule_ref,
                    name_scopes,
                    content_scopes,
                    end_pattern: None,
                    begin_rule_has_captured_eol: false,
                    anchor_position: None,
                    enter_position: Some(cap_start),
                });

                #[cfg(feature = "debug")]
                log::debug!(
                    "[resolve_captures] Retokenizing capture {i} at [{cap_start}..{cap_end}]: {:?}",
                    &line[cap_start..cap_end]
                );
                let (retokenized, _) = self.tokenize_from(
                    retokenization_stack,
                    &line[..cap_end],
                    cap_start,
                    is_first_line && cap_start == 0,
                    false,
                );
                for token in retokenized.tokens {
                    acc.produce(token.span.end, &token.scopes);
                }
                continue;
            }

            let rule_scopes = rule.name_scopes(line, captures);
            if !rule_scopes.is_empty() {
                let mut scopes = base_scopes;
                scopes.extend(rule_scopes);
                local_stack.push((scopes, cap_end));
            }
        }

        while let Some((scopes, end_pos)) = local_stack.pop() {
            acc.produce(end_pos, &scopes);
        }
    }

    /// Forces the cursor one char forward when a zero-width match would make us loop forever
    fn force_advance(
        &self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        acc: &mut TokenAccumulator,
    ) -> usize {
        let next = next_char_boundary(line, pos);
        log::warn!(
            "Grammar {} is stuck at byte {pos} with {:?}, skipping a char",
            self.registry.grammar(self.base_grammar_id).name,
            self.registry.rule(stack.top().rule_ref).original_name()
        );
        acc.produce(next, &stack.top().content_scopes);
        next
    }

    /// Tokenizes `line` from `start`, returning the tokens from `start` and the new state.
    /// `check_while` is only false when tokenizing the text of a capture again.
    fn tokenize_from(
        &mut self,
        mut stack: StateStack,
        line: &str,
        start: usize,
        is_first_line: bool,
        check_while: bool,
    ) -> (TokenAccumulator, StateStack) {
        let registry = self.registry;
        let mut acc = TokenAccumulator::new(start);
        let mut pos = start;
        let mut anchor_position = None;
        let mut is_first_line = is_first_line;

        // 1. Are the while patterns still true
        if check_while {
            (anchor_position, is_first_line) =
                self.check_while_conditions(&mut stack, line, &mut pos, &mut acc, is_first_line);
        }

        // 2. Find the next match until the end of the line
        while pos < line.len() {
            #[cfg(feature = "debug")]
            log::trace!("[tokenize_from] Scanning {pos}: {:?}", &line[pos..]);

            let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
            let Some(m) = self.match_rule_or_injections(&stack, line, pos, anchors) else {
                #[cfg(feature = "debug")]
                log::debug!("[tokenize_from] no more matches");
                break;
            };

            #[cfg(feature = "debug")]
            log::debug!(
                "[tokenize_from] Matched {:?} from {} to {} => {:?}",
                m.rule_ref,
                m.start,
                m.end,
                &line[m.start..m.end]
            );

            let has_advanced = m.end > pos;

            if m.rule_ref.rule == END_RULE_ID {
                let top = stack.top().clone();
                let Rule::BeginEnd(b) = registry.rule(top.rule_ref) else {
                    break;
                };

                acc.produce(m.start, &top.content_scopes);
                stack.top_mut().content_scopes = top.name_scopes.clone();
                self.resolve_captures(
                    &stack,
                    line,
                    top.rule_ref.grammar,
                    &b.end_captures,
                    &m.capture_pos,
                    &mut acc,
                    is_first_line,
                );
                acc.produce(m.end, &top.name_scopes);

                stack.pop();
                anchor_position = top.anchor_position;

                // Pushed and popped without advancing
                if !has_advanced && top.enter_position == Some(pos) {
                    pos = self.force_advance(&stack, line, pos, &mut acc);
                    is_first_line = false;
                    continue;
                }
            } else {
                let rule = registry.rule(m.rule_ref);
                let content_scopes = stack.top().content_scopes.clone();
                acc.produce(m.start, &content_scopes);

                let mut name_scopes = content_scopes;
                name_scopes.extend(rule.name_scopes(line, &m.capture_pos));
                stack.push(StackFrame {
                    rule_ref: m.rule_ref,
                    name_scopes: name_scopes.clone(),
                    content_scopes: name_scopes,
                    end_pattern: None,
                    begin_rule_has_captured_eol: m.end == line.len(),
                    anchor_position,
                    enter_position: Some(pos),
                });

                let begin = match rule {
                    Rule::BeginEnd(r) => Some((r.end, r.end_has_backrefs, &r.begin_captures)),
                    Rule::BeginWhile(r) => {
                        Some((r.while_, r.while_has_backrefs, &r.begin_captures))
                    }
                    Rule::Match(r) => {
                        self.resolve_captures(
                            &stack,
                            line,
                            m.rule_ref.grammar,
                            &r.captures,
                            &m.capture_pos,
                            &mut acc,
                            is_first_line,
                        );
                        acc.produce(m.end, &stack.top().content_scopes);
                        // a match rule only lives for its own match
                        stack.pop();

                        if !has_advanced {
                            pos = self.force_advance(&stack, line, pos, &mut acc);
                            is_first_line = false;
                            continue;
                        }
                        None
                    }
                    Rule::IncludeOnly(_) | Rule::Include(_) | Rule::Noop => {
                        stack.pop();
                        None
                    }
                };

                if let Some((end_regex, end_has_backrefs, begin_captures)) = begin {
                    self.handle_begin(
                        &mut stack,
                        line,
                        &m,
                        (end_regex, end_has_backrefs),
                        begin_captures,
                        &mut acc,
                        is_first_line,
                    );
                    anchor_position = Some(m.end);

                    // Entering the same rule again at the same position
                    if !has_advanced && stack.has_same_rule_entered_at(m.rule_ref, pos) {
                        stack.pop();
                        pos = self.force_advance(&stack, line, pos, &mut acc);
                        is_first_line = false;
                        continue;
                    }
                }
            }

            if has_advanced {
                pos = m.end;
                is_first_line = false;
            }
        }

        acc.produce(line.len(), &stack.top().content_scopes);
        (acc, stack)
    }

    /// Tokens for the begin delimiter, then the frame gets its content scopes and its end
    /// pattern with the backreferences resolved
    #[allow(clippy::too_many_arguments)]
    fn handle_begin(
        &mut self,
        stack: &mut StateStack,
        line: &str,
        m: &PatternSetMatch,
        (end_regex, end_has_backrefs): (RegexId, bool),
        begin_captures: &[Option<RuleId>],
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) {
        let registry = self.registry;
        let grammar = registry.grammar(m.rule_ref.grammar);
        let rule = grammar.rule(m.rule_ref.rule);

        #[cfg(feature = "debug")]
        log::debug!(
            "[handle_begin] Pushing {:?}",
            rule.original_name().unwrap_or("No name")
        );

        self.resolve_captures(
            stack,
            line,
            m.rule_ref.grammar,
            begin_captures,
            &m.capture_pos,
            acc,
            is_first_line,
        );
        acc.produce(m.end, &stack.top().content_scopes);

        let top = stack.top_mut();
        top.content_scopes
            .extend(rule.content_scopes(line, &m.capture_pos));
        if end_has_backrefs {
            top.end_pattern = Some(resolve_backreferences(
                grammar.regex(end_regex).pattern(),
                line,
                &m.capture_pos,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::RawGrammar;
    use crate::test_utils::get_registry;

    fn registry_from_json(json: &str) -> Registry {
        let mut registry = Registry::default();
        registry
            .add_grammar_from_raw(RawGrammar::from_json_str(json).unwrap())
            .unwrap();
        registry.link_grammars().unwrap();
        registry
    }

    /// One line per token: `text: scope scope...`
    fn format_tokens(text: &str, lines: &[Vec<Token>]) -> String {
        let normalized = normalize_string(text);
        let mut out = String::new();
        for (line, tokens) in normalized.split('\n').zip(lines) {
            for token in tokens {
                let scopes: Vec<_> = token.scopes.iter().map(|s| s.as_str()).collect();
                out.push_str(&format!("{:?}: {}\n", &line[token.span.clone()], scopes.join(" ")));
            }
        }
        out
    }

    fn assert_covers_lines(text: &str, lines: &[Vec<Token>]) {
        let normalized = normalize_string(text);
        for (line, tokens) in normalized.split('\n').zip(lines) {
            let mut end = 0;
            for token in tokens {
                assert_eq!(token.span.start, end, "gap or overlap in {line:?}: {tokens:?}");
                assert!(token.span.end > token.span.start, "empty token in {line:?}");
                end = token.span.end;
            }
            assert_eq!(end, line.len(), "line {line:?} not fully covered");
        }
    }

    const STRING_AND_NUMBER: &str = r#"{
        "name": "demo",
        "scopeName": "source.demo",
        "patterns": [
            { "begin": "\"", "end": "\"", "name": "string" },
            { "match": "\\d+", "name": "number" }
        ]
    }"#;

    #[test]
    fn string_and_numbers() {
        let registry = registry_from_json(STRING_AND_NUMBER);
        let text = r#"12 "ab" 34"#;
        let tokens = registry.tokenize("demo", text).unwrap();
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        "12": source.demo number
        " ": source.demo
        "\"": source.demo string
        "ab": source.demo string
        "\"": source.demo string
        " ": source.demo
        "34": source.demo number
        "#);
    }

    #[test]
    fn earlier_rule_wins_ties() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [
                    { "match": "abc", "name": "keyword" },
                    { "match": "[a-z]+", "name": "identifier" }
                ]
            }"#,
        );
        let tokens = registry.tokenize("demo", "abc").unwrap();
        assert_eq!(
            tokens[0],
            vec![Token {
                span: 0..3,
                scopes: vec![Scope::new("source.demo"), Scope::new("keyword")]
            }]
        );
    }

    #[test]
    fn regions_span_lines_and_states_can_be_resumed() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [
                    { "begin": "/\\*", "end": "\\*/", "name": "comment.block", "contentName": "comment.content" },
                    { "match": "\\w+", "name": "word" }
                ]
            }"#,
        );
        let mut tokenizer = registry.tokenizer("demo").unwrap();
        let first = tokenizer.tokenize_line("a /* b", None).unwrap();
        assert_eq!(first.state.depth(), 2);
        assert_eq!(
            first.tokens.last().unwrap().scopes,
            vec![
                Scope::new("source.demo"),
                Scope::new("comment.block"),
                Scope::new("comment.content")
            ]
        );

        let second = tokenizer.tokenize_line("c */ d", Some(&first.state)).unwrap();
        assert_eq!(second.state.depth(), 1);
        let scopes: Vec<_> = second.tokens.iter().map(|t| t.scopes.len()).collect();
        // "c ", "*/", " ", "d"
        assert_eq!(second.tokens[0].span, 0..2);
        assert_eq!(scopes, vec![3, 2, 1, 2]);

        // resuming from a saved state gives the same result
        let again = tokenizer.tokenize_line("c */ d", Some(&first.state)).unwrap();
        assert_eq!(again, second);
    }

    #[test]
    fn incremental_tokenization_matches_whole_document() {
        let registry = get_registry();
        let text = "public class Foo {\n  /* multi\n  line */ String s = 'x';\n}\n";
        let whole = registry.tokenize("Apex", text).unwrap();

        let mut tokenizer = registry.tokenizer("Apex").unwrap();
        let mut state = None;
        let mut states = Vec::new();
        for (i, line) in text.split('\n').enumerate() {
            let line_tokens = tokenizer.tokenize_line(line, state.as_ref()).unwrap();
            assert_eq!(line_tokens.tokens, whole[i]);
            states.push(line_tokens.state.clone());
            state = Some(line_tokens.state);
        }

        // restarting from the state after line 2 with a fresh tokenizer
        let mut fresh = registry.tokenizer("Apex").unwrap();
        let resumed = fresh.tokenize_line("  line */ String s = 'x';", Some(&states[1])).unwrap();
        assert_eq!(resumed.tokens, whole[2]);
        assert_eq!(resumed.state, states[2]);
    }

    #[test]
    fn foreign_states_are_rejected() {
        let registry = get_registry();
        let other = get_registry();
        let state = registry
            .tokenizer("Apex")
            .unwrap()
            .tokenize_line("x", None)
            .unwrap()
            .state;

        let mut soql = registry.tokenizer("SOQL").unwrap();
        assert!(matches!(
            soql.tokenize_line("x", Some(&state)),
            Err(Error::ForeignState)
        ));
        let mut apex = other.tokenizer("Apex").unwrap();
        assert!(matches!(
            apex.tokenize_line("x", Some(&state)),
            Err(Error::ForeignState)
        ));
    }

    #[test]
    fn zero_width_rules_terminate() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [
                    { "match": "(?=x)", "name": "lookahead" },
                    { "begin": "(?=y)", "end": "(?=y)", "name": "region" },
                    { "begin": "", "end": "(?=z)", "name": "empty" }
                ]
            }"#,
        );
        let text = "xxyyzz\nabc";
        let tokens = registry.tokenize("demo", text).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_covers_lines(text, &tokens);
    }

    #[test]
    fn zero_width_begin_at_same_position_advances() {
        let registry = registry_from_json(
            r##"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [{ "include": "#block" }],
                "repository": {
                    "block": {
                        "begin": "(?=a)", "end": "b", "name": "block",
                        "patterns": [{ "include": "#block" }]
                    }
                }
            }"##,
        );
        let text = "aab";
        let tokens = registry.tokenize("demo", text).unwrap();
        assert_covers_lines(text, &tokens);
    }

    #[test]
    fn capture_including_its_own_grammar_terminates() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [{
                    "match": "(a)", "name": "letter",
                    "captures": { "1": { "patterns": [{ "include": "$self" }] } }
                }]
            }"#,
        );
        let text = "ab";
        let tokens = registry.tokenize("demo", text).unwrap();
        assert_covers_lines(text, &tokens);
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        "a": source.demo letter letter
        "b": source.demo
        "#);
    }

    #[test]
    fn end_backreferences() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [
                    { "begin": "(['\"])", "end": "\\1", "name": "string" }
                ]
            }"#,
        );
        let text = r#"'a"b' "c'd""#;
        let tokens = registry.tokenize("demo", text).unwrap();
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        "'": source.demo string
        "a\"b": source.demo string
        "'": source.demo string
        " ": source.demo
        "\"": source.demo string
        "c'd": source.demo string
        "\"": source.demo string
        "#);
    }

    #[test]
    fn apply_end_pattern_last() {
        let grammar = |last: bool| {
            registry_from_json(&format!(
                r#"{{
                    "name": "demo",
                    "scopeName": "source.demo",
                    "patterns": [{{
                        "begin": "<", "end": ">", "name": "tag", "applyEndPatternLast": {last},
                        "patterns": [{{ "match": ">>", "name": "shift" }}]
                    }}]
                }}"#
            ))
        };
        let end_first = grammar(false).tokenize("demo", "<a>>").unwrap();
        assert_eq!(end_first[0].last().unwrap().span, 3..4);
        assert_eq!(end_first[0][2].span, 2..3);

        let end_last = grammar(true).tokenize("demo", "<a>>").unwrap();
        let last = end_last[0].last().unwrap();
        assert_eq!(last.span, 2..4);
        assert_eq!(last.scopes.last(), Some(&Scope::new("shift")));
    }

    #[test]
    fn begin_while_rules() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [
                    { "begin": "^>", "while": "^>", "name": "quote",
                      "patterns": [{ "match": "\\w+", "name": "word" }] }
                ]
            }"#,
        );
        let text = "> a\n> b\nc";
        let tokens = registry.tokenize("demo", text).unwrap();
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        ">": source.demo quote
        " ": source.demo quote
        "a": source.demo quote word
        ">": source.demo quote
        " ": source.demo quote
        "b": source.demo quote word
        "c": source.demo
        "#);
    }

    #[test]
    fn captures_with_patterns_are_retokenized() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [{
                    "match": "(\\w+)\\((.*)\\)",
                    "name": "call",
                    "captures": {
                        "1": { "name": "entity.name.function.$1" },
                        "2": { "patterns": [{ "match": "\\d+", "name": "number" }] }
                    }
                }]
            }"#,
        );
        let text = "foo(1, 2)";
        let tokens = registry.tokenize("demo", text).unwrap();
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        "foo": source.demo call entity.name.function.foo
        "(": source.demo call
        "1": source.demo call number
        ", ": source.demo call
        "2": source.demo call number
        ")": source.demo call
        "#);
    }

    #[test]
    fn g_anchor_only_right_after_begin() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [{
                    "begin": "@", "end": "$", "name": "annotation",
                    "patterns": [{ "match": "\\G\\w+", "name": "annotation.name" }]
                }]
            }"#,
        );
        let tokens = registry.tokenize("demo", "@Future Future").unwrap();
        let named: Vec<_> = tokens[0]
            .iter()
            .filter(|t| t.scopes.last() == Some(&Scope::new("annotation.name")))
            .map(|t| t.span.clone())
            .collect();
        assert_eq!(named, vec![1..7]);
    }

    #[test]
    fn a_anchor_only_on_first_line() {
        let registry = registry_from_json(
            r#"{
                "name": "demo",
                "scopeName": "source.demo",
                "patterns": [{ "match": "\\A#!.*", "name": "shebang" }]
            }"#,
        );
        let tokens = registry.tokenize("demo", "#!run\n#!run").unwrap();
        assert_eq!(tokens[0][0].scopes.len(), 2);
        assert_eq!(tokens[1][0].scopes.len(), 1);
    }

    #[test]
    fn injections_follow_their_precedence() {
        let grammar = |selector: &str| {
            registry_from_json(&format!(
                r#"{{
                    "name": "demo",
                    "scopeName": "source.demo",
                    "patterns": [{{ "match": "todo", "name": "word" }}],
                    "injections": {{
                        "{selector}": {{ "patterns": [{{ "match": "todo", "name": "injected" }}] }}
                    }}
                }}"#
            ))
        };
        let last_scope = |registry: Registry| {
            registry.tokenize("demo", "todo").unwrap()[0][0]
                .scopes
                .last()
                .cloned()
        };
        assert_eq!(last_scope(grammar("L:source.demo")), Some(Scope::new("injected")));
        assert_eq!(last_scope(grammar("R:source.demo")), Some(Scope::new("word")));
        assert_eq!(last_scope(grammar("source.demo")), Some(Scope::new("word")));
        assert_eq!(last_scope(grammar("L:source.other")), Some(Scope::new("word")));
    }

    #[test]
    fn empty_lines_and_documents() {
        let registry = registry_from_json(STRING_AND_NUMBER);
        assert!(registry.tokenize("demo", "").unwrap().is_empty());
        let tokens = registry.tokenize("demo", "1\r\n\r\n2\r3").unwrap();
        assert_eq!(tokens.len(), 4);
        assert!(tokens[1].is_empty());
        assert_eq!(tokens[3][0].span, 0..1);
    }

    #[test]
    fn tokenizes_apex_fixture() {
        let registry = get_registry();
        let text = "public class Foo {\n    // TODO\n    String q = 'it\\'s';\n}";
        let tokens = registry.tokenize("Apex", text).unwrap();
        assert_covers_lines(text, &tokens);
        insta::assert_snapshot!(format_tokens(text, &tokens), @r#"
        "public": source.apex storage.modifier.apex
        " ": source.apex
        "class": source.apex storage.type.class.apex
        " ": source.apex
        "Foo": source.apex entity.name.type.class.apex
        " ": source.apex
        "{": source.apex punctuation.curlybrace.open.apex
        "    ": source.apex
        "//": source.apex comment.line.double-slash.apex punctuation.definition.comment.apex
        " TODO": source.apex comment.line.double-slash.apex
        "    ": source.apex
        "String": source.apex storage.type.apex
        " ": source.apex
        "q": source.apex variable.other.apex
        " ": source.apex
        "=": source.apex keyword.operator.assignment.apex
        " ": source.apex
        "'": source.apex string.quoted.single.apex punctuation.definition.string.begin.apex
        "it": source.apex string.quoted.single.apex
        "\\'": source.apex string.quoted.single.apex constant.character.escape.apex
        "s": source.apex string.quoted.single.apex
        "'": source.apex string.quoted.single.apex punctuation.definition.string.end.apex
        ";": source.apex punctuation.terminator.statement.apex
        "}": source.apex punctuation.curlybrace.close.apex
        "#);
    }

    #[test]
    fn soql_embedded_in_apex() {
        let registry = get_registry();
        let text = "List<Account> a = [SELECT Id FROM Account WHERE Name = :name];";
        let tokens = registry.tokenize("Apex", text).unwrap();
        assert_covers_lines(text, &tokens);
        let select = tokens[0]
            .iter()
            .find(|t| &text[t.span.clone()] == "SELECT")
            .unwrap();
        assert_eq!(
            select.scopes,
            vec![
                Scope::new("source.apex"),
                Scope::new("meta.soql.apex"),
                Scope::new("keyword.operator.query.select.soql")
            ]
        );
        let bind = tokens[0]
            .iter()
            .find(|t| &text[t.span.clone()] == "name")
            .unwrap();
        assert_eq!(bind.scopes.last(), Some(&Scope::new("variable.other.apex")));
    }

    #[test]
    fn tokenizing_is_deterministic() {
        let registry = get_registry();
        let text = "if (x < 10) { y = [SELECT Id FROM Contact]; } /* done";
        let first = registry.tokenize("Apex", text).unwrap();
        for _ in 0..3 {
            assert_eq!(registry.tokenize("Apex", text).unwrap(), first);
        }
    }
}
