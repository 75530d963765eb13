use std::fmt;

use crate::Registry;
use crate::grammars::{END_RULE_ID, GlobalRuleRef, GrammarId, ROOT_RULE_ID, Rule};
use crate::scope::Scope;

/// One active context: the grammar root or a begin/end or begin/while region.
#[derive(Clone, Debug, PartialEq)]
pub struct StackFrame {
    /// The rule that pushed this frame
    pub rule_ref: GlobalRuleRef,
    /// Scopes of the delimiters: the parent content scopes plus the rule `name`
    pub name_scopes: Vec<Scope>,
    /// Scopes of the text between the delimiters: `name_scopes` plus the rule `contentName`
    pub content_scopes: Vec<Scope>,
    /// The end/while pattern once backreferences to the begin captures are resolved.
    /// `None` means the rule pattern is used as is.
    pub end_pattern: Option<String>,
    /// The begin match ended with the line, `\G` then matches at the start of the next line
    pub begin_rule_has_captured_eol: bool,
    /// The anchor position to restore when this frame is popped
    pub anchor_position: Option<usize>,
    /// Where the frame was pushed in the current line, `None` on later lines
    pub enter_position: Option<usize>,
}

impl StackFrame {
    /// A frame for `rule_ref` whose scopes are all `scopes` for now
    pub fn new(rule_ref: GlobalRuleRef, scopes: Vec<Scope>) -> Self {
        Self {
            rule_ref,
            name_scopes: scopes.clone(),
            content_scopes: scopes,
            end_pattern: None,
            begin_rule_has_captured_eol: false,
            anchor_position: None,
            enter_position: None,
        }
    }
}

/// The only state carried from one line to the next.
///
/// Always has a root frame for the grammar top-level patterns. It's a plain value: store the
/// state after line N and hand it back to tokenize line N+1 whenever you want.
#[derive(Clone, PartialEq)]
pub struct StateStack {
    root: StackFrame,
    /// Frames above the root, innermost last
    frames: Vec<StackFrame>,
    /// Which registry created it
    pub(crate) registry_uid: u64,
    /// `$base` resolves to this grammar
    pub(crate) base_grammar: GrammarId,
    /// No line was tokenized with it yet: `\A` can match
    pub(crate) at_document_start: bool,
}

impl StateStack {
    pub(crate) fn new(registry_uid: u64, grammar_id: GrammarId, grammar_scope: Scope) -> Self {
        Self {
            root: StackFrame::new(
                GlobalRuleRef {
                    grammar: grammar_id,
                    rule: ROOT_RULE_ID,
                },
                vec![grammar_scope],
            ),
            frames: Vec::new(),
            registry_uid,
            base_grammar: grammar_id,
            at_document_start: true,
        }
    }

    pub fn push(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    /// Exits the current context. The root frame is never popped.
    pub fn pop(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> &StackFrame {
        self.frames.last().unwrap_or(&self.root)
    }

    pub(crate) fn top_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    /// The innermost active context
    pub fn current(&self) -> &StackFrame {
        self.top()
    }

    /// Number of frames including the root
    pub fn depth(&self) -> usize {
        self.frames.len() + 1
    }

    pub fn is_root(&self) -> bool {
        self.frames.is_empty()
    }

    /// All frames from the root to the innermost one
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        std::iter::once(&self.root).chain(self.frames.iter())
    }

    /// Keeps only the first `depth` frames, the root being always kept
    pub(crate) fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth.saturating_sub(1));
    }

    /// Whether a frame for `rule_ref` was pushed at `pos` just below the current one, ie
    /// pushing it again would not make any progress
    pub(crate) fn has_same_rule_entered_at(&self, rule_ref: GlobalRuleRef, pos: usize) -> bool {
        let below_top = self.frames.len().saturating_sub(1);
        std::iter::once(&self.root)
            .chain(self.frames[..below_top].iter())
            .rev()
            .take_while(|frame| frame.enter_position == Some(pos))
            .any(|frame| frame.rule_ref == rule_ref)
    }

    /// Whether any frame for `rule_ref` was entered at `pos`
    pub(crate) fn has_rule_entered_at(&self, rule_ref: GlobalRuleRef, pos: usize) -> bool {
        self.frames()
            .any(|frame| frame.rule_ref == rule_ref && frame.enter_position == Some(pos))
    }

    /// Forgets the positions that only make sense within the line just tokenized
    pub fn reset(&mut self) {
        for frame in std::iter::once(&mut self.root).chain(self.frames.iter_mut()) {
            frame.enter_position = None;
            frame.anchor_position = None;
        }
    }

    /// The rules that can match in the current context, in priority order: the end pattern
    /// (first, or last with `applyEndPatternLast`) and the nested patterns with every include
    /// expanded. A rule reachable several times is only listed at its first position.
    pub fn eligible_rules(&self, registry: &Registry) -> Vec<(GlobalRuleRef, String)> {
        let top = self.top();
        let mut patterns: Vec<(GlobalRuleRef, String)> = registry
            .collect_patterns(self.base_grammar, top.rule_ref)
            .into_iter()
            .map(|(rule_ref, pat)| (rule_ref, pat.to_owned()))
            .collect();

        let grammar = registry.grammar(top.rule_ref.grammar);
        if let Rule::BeginEnd(b) = grammar.rule(top.rule_ref.rule) {
            let end_pattern = top
                .end_pattern
                .clone()
                .unwrap_or_else(|| grammar.regex(b.end).pattern().to_owned());
            let end_rule_ref = GlobalRuleRef {
                grammar: top.rule_ref.grammar,
                rule: END_RULE_ID,
            };
            if b.apply_end_pattern_last {
                patterns.push((end_rule_ref, end_pattern));
            } else {
                patterns.insert(0, (end_rule_ref, end_pattern));
            }
        }

        patterns
    }
}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateStack:")?;

        for (depth, frame) in self.frames().enumerate() {
            let indent = "  ".repeat(depth);
            write!(
                f,
                "{}grammar={}, rule={}",
                indent, frame.rule_ref.grammar.0, frame.rule_ref.rule.0
            )?;

            let join = |scopes: &[Scope]| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            write!(f, " name=[{}]", join(&frame.name_scopes))?;
            write!(f, ", content=[{}]", join(&frame.content_scopes))?;

            if let Some(pattern) = &frame.end_pattern {
                write!(f, ", end_pattern={pattern:?}")?;
            }
            write!(f, ", anchor_pos={:?}", frame.anchor_position)?;
            if let Some(enter_pos) = frame.enter_position {
                write!(f, ", enter_pos={enter_pos}")?;
            }
            writeln!(
                f,
                ", begin_rule_has_captured_eol={}",
                frame.begin_rule_has_captured_eol
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::RuleId;

    fn rule(id: u32) -> GlobalRuleRef {
        GlobalRuleRef {
            grammar: GrammarId(0),
            rule: RuleId(id),
        }
    }

    fn stack() -> StateStack {
        StateStack::new(0, GrammarId(0), Scope::new("source.test"))
    }

    #[test]
    fn root_is_never_popped() {
        let mut stack = stack();
        assert!(stack.pop().is_none());
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().rule_ref, rule(0));

        stack.push(StackFrame::new(rule(3), vec![Scope::new("string")]));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.current().rule_ref, rule(3));
        assert_eq!(stack.pop().map(|f| f.rule_ref), Some(rule(3)));
        assert!(stack.pop().is_none());
        assert!(stack.is_root());
    }

    #[test]
    fn clones_do_not_alias() {
        let mut stack = stack();
        let saved = stack.clone();
        stack.push(StackFrame::new(rule(3), vec![]));
        assert_ne!(stack, saved);
        assert_eq!(saved.depth(), 1);
    }

    #[test]
    fn detects_same_rule_entered_at_position() {
        let mut stack = stack();
        let mut frame = StackFrame::new(rule(3), vec![]);
        frame.enter_position = Some(4);
        stack.push(frame.clone());
        stack.push(frame);
        assert!(stack.has_same_rule_entered_at(rule(3), 4));
        assert!(!stack.has_same_rule_entered_at(rule(3), 5));
        assert!(!stack.has_same_rule_entered_at(rule(2), 4));

        stack.reset();
        assert!(!stack.has_same_rule_entered_at(rule(3), 4));
    }

    #[test]
    fn detects_rule_entered_anywhere_at_position() {
        let mut stack = stack();
        let mut frame = StackFrame::new(rule(5), vec![]);
        frame.enter_position = Some(2);
        stack.push(frame);
        stack.push(StackFrame::new(rule(6), vec![]));
        assert!(stack.has_rule_entered_at(rule(5), 2));
        assert!(!stack.has_rule_entered_at(rule(5), 3));
        assert!(!stack.has_rule_entered_at(rule(6), 2));
        // Only frames below the top are considered by the stricter check
        assert!(!stack.has_same_rule_entered_at(rule(5), 2));
    }

    #[test]
    fn truncate_keeps_root() {
        let mut stack = stack();
        stack.push(StackFrame::new(rule(1), vec![]));
        stack.push(StackFrame::new(rule(2), vec![]));
        stack.truncate(2);
        assert_eq!(stack.top().rule_ref, rule(1));
        stack.truncate(0);
        assert!(stack.is_root());
    }
}
