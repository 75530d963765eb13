use std::fmt::{Debug, Formatter};

use onig::{RegSet, RegexOptions, Region, SearchOptions};

use crate::grammars::GlobalRuleRef;
use crate::grammars::regex::{CapturePositions, compile_onig};

/// The result of searching an eligible set: which rule matched, where, and its captures.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PatternSetMatch {
    pub rule_ref: GlobalRuleRef,
    pub start: usize,
    pub end: usize,
    pub capture_pos: CapturePositions,
}

enum Backend {
    Empty,
    /// Oniguruma evaluates all the patterns in one pass
    Set(RegSet),
    /// RegSet refuses the whole set if one pattern is invalid, we then try each regex in turn.
    /// Invalid ones never match.
    Scan(Vec<Option<onig::Regex>>),
}

/// An eagerly compiled, ordered list of patterns searched together.
///
/// The winner is the match with the smallest start offset; on ties the pattern declared
/// first wins.
pub struct PatternSet {
    rule_refs: Vec<GlobalRuleRef>,
    backend: Backend,
}

impl PatternSet {
    pub fn new(items: Vec<(GlobalRuleRef, String)>) -> Self {
        if items.is_empty() {
            return Self {
                rule_refs: Vec::new(),
                backend: Backend::Empty,
            };
        }

        let (rule_refs, patterns): (Vec<_>, Vec<_>) = items.into_iter().unzip();
        let pattern_strs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();

        let backend =
            match RegSet::with_options(&pattern_strs, RegexOptions::REGEX_OPTION_CAPTURE_GROUP) {
                Ok(regset) => Backend::Set(regset),
                Err(_) => {
                    let regexes = pattern_strs
                        .iter()
                        .map(|p| match compile_onig(p) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                log::warn!("Pattern {p:?} will never match: {e}");
                                None
                            }
                        })
                        .collect();
                    Backend::Scan(regexes)
                }
            };

        Self { rule_refs, backend }
    }

    pub fn is_empty(&self) -> bool {
        self.rule_refs.is_empty()
    }

    /// Finds the best match in `text` starting the search at `pos`.
    pub(crate) fn find_at(&self, text: &str, pos: usize) -> Option<PatternSetMatch> {
        if pos > text.len() {
            return None;
        }
        match &self.backend {
            Backend::Empty => None,
            Backend::Set(regset) => {
                // The full text is given so look-behinds can see before `pos`
                let (pattern_index, captures) = regset.captures_with_options(
                    text,
                    pos,
                    text.len(),
                    onig::RegSetLead::Position,
                    SearchOptions::SEARCH_OPTION_NONE,
                )?;
                let (start, end) = captures.pos(0)?;
                Some(PatternSetMatch {
                    rule_ref: self.rule_refs[pattern_index],
                    start,
                    end,
                    capture_pos: (0..captures.len()).map(|i| captures.pos(i)).collect(),
                })
            }
            Backend::Scan(regexes) => {
                let mut best: Option<PatternSetMatch> = None;
                for (index, re) in regexes.iter().enumerate() {
                    let Some(re) = re else {
                        continue;
                    };
                    let mut region = Region::new();
                    if re
                        .search_with_options(
                            text,
                            pos,
                            text.len(),
                            SearchOptions::SEARCH_OPTION_NONE,
                            Some(&mut region),
                        )
                        .is_none()
                    {
                        continue;
                    }
                    let Some((start, end)) = region.pos(0) else {
                        continue;
                    };
                    // strictly smaller so the earlier pattern keeps ties
                    if best.as_ref().is_some_and(|b| b.start <= start) {
                        continue;
                    }
                    best = Some(PatternSetMatch {
                        rule_ref: self.rule_refs[index],
                        start,
                        end,
                        capture_pos: (0..region.len()).map(|i| region.pos(i)).collect(),
                    });
                    if start == pos {
                        break;
                    }
                }
                best
            }
        }
    }
}

impl Debug for PatternSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backend {
            Backend::Empty => "empty",
            Backend::Set(_) => "regset",
            Backend::Scan(_) => "scan",
        };
        write!(f, "PatternSet({} rules, {kind})", self.rule_refs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::{GrammarId, RuleId};

    fn rule(id: u32) -> GlobalRuleRef {
        GlobalRuleRef {
            grammar: GrammarId(0),
            rule: RuleId(id),
        }
    }

    #[test]
    fn earliest_match_wins() {
        let set = PatternSet::new(vec![
            (rule(1), r"\d+".to_owned()),
            (rule(2), r"[a-z]+".to_owned()),
        ]);
        let m = set.find_at("abc 12", 0).unwrap();
        assert_eq!(m.rule_ref, rule(2));
        assert_eq!((m.start, m.end), (0, 3));
        let m = set.find_at("abc 12", 3).unwrap();
        assert_eq!(m.rule_ref, rule(1));
        assert_eq!((m.start, m.end), (4, 6));
    }

    #[test]
    fn declared_order_breaks_ties() {
        let set = PatternSet::new(vec![
            (rule(1), r"abc".to_owned()),
            (rule(2), r"[a-z]+".to_owned()),
        ]);
        let m = set.find_at("abcdef", 0).unwrap();
        assert_eq!(m.rule_ref, rule(1));
        assert_eq!(m.end, 3);
    }

    #[test]
    fn empty_set_never_matches() {
        let set = PatternSet::new(vec![]);
        assert!(set.is_empty());
        assert!(set.find_at("anything", 0).is_none());
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let set = PatternSet::new(vec![
            (rule(1), r"(oops".to_owned()),
            (rule(2), r"\w+".to_owned()),
        ]);
        let m = set.find_at("word", 0).unwrap();
        assert_eq!(m.rule_ref, rule(2));
    }

    #[test]
    fn captures_are_absolute() {
        let set = PatternSet::new(vec![(rule(1), r"(@)(\w+)".to_owned())]);
        let m = set.find_at("x @Future", 0).unwrap();
        assert_eq!(m.capture_pos, vec![Some((2, 9)), Some((2, 3)), Some((3, 9))]);
    }
}
