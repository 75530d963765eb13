use std::borrow::Cow;
use std::fmt;

/// Which of the `\A` and `\G` anchors are allowed to match for a given search.
///
/// `\A` only makes sense on the first line of a document and `\G` only at the position
/// where the previous rule stopped. A disabled anchor is replaced by a character that will
/// never appear in a line so the regex simply can't match there.
#[derive(Copy, Clone, PartialEq, Hash, Eq)]
pub enum AnchorActive {
    A,
    G,
    AG,
    None,
}

/// Stands in for a disabled anchor
const NEVER_MATCHES: &str = "\u{FFFF}";

impl AnchorActive {
    pub fn new(is_first_line: bool, anchor_position: Option<usize>, current_pos: usize) -> Self {
        let g_active = anchor_position == Some(current_pos);

        match (is_first_line, g_active) {
            (true, true) => AnchorActive::AG,
            (true, false) => AnchorActive::A,
            (false, true) => AnchorActive::G,
            (false, false) => AnchorActive::None,
        }
    }

    /// Slot used by `Regex` to cache one compiled variant per anchor state
    pub fn index(self) -> usize {
        match self {
            AnchorActive::AG => 0,
            AnchorActive::A => 1,
            AnchorActive::G => 2,
            AnchorActive::None => 3,
        }
    }

    fn allows(self, anchor: char) -> bool {
        match anchor {
            'A' => matches!(self, AnchorActive::A | AnchorActive::AG),
            'G' => matches!(self, AnchorActive::G | AnchorActive::AG),
            _ => true,
        }
    }

    /// Rewrites the pattern so the disabled anchors can't match.
    /// Escaped backslashes (`\\G`) are left alone.
    pub fn replace_anchors<'a>(&self, pat: &'a str) -> Cow<'a, str> {
        if *self == AnchorActive::AG || !has_anchors(pat) {
            return Cow::Borrowed(pat);
        }

        let mut out = String::with_capacity(pat.len());
        let mut chars = pat.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some(next @ ('A' | 'G')) if !self.allows(next) => out.push_str(NEVER_MATCHES),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        }
        Cow::Owned(out)
    }
}

/// Whether the pattern uses `\A` or `\G` at all, in which case the compiled regex depends on
/// the anchor state.
pub fn has_anchors(pat: &str) -> bool {
    pat.contains("\\A") || pat.contains("\\G")
}

impl fmt::Debug for AnchorActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allow_A={}, allow_G={}",
            self.allows('A'),
            self.allows('G')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn g_is_only_active_at_anchor_position() {
        assert_eq!(AnchorActive::new(false, Some(3), 3), AnchorActive::G);
        assert_eq!(AnchorActive::new(false, Some(3), 4), AnchorActive::None);
        assert_eq!(AnchorActive::new(true, None, 0), AnchorActive::A);
        assert_eq!(AnchorActive::new(true, Some(0), 0), AnchorActive::AG);
    }

    #[test]
    fn disabled_anchors_are_replaced() {
        assert_eq!(AnchorActive::AG.replace_anchors(r"\G\Ax"), r"\G\Ax");
        assert_eq!(AnchorActive::A.replace_anchors(r"\G\Ax"), "\u{FFFF}\\Ax");
        assert_eq!(AnchorActive::G.replace_anchors(r"\G\Ax"), "\\G\u{FFFF}x");
        assert_eq!(AnchorActive::None.replace_anchors(r"\G|\d"), "\u{FFFF}|\\d");
        // A literal backslash followed by G is not an anchor
        assert_eq!(AnchorActive::None.replace_anchors(r"\\G\A"), "\\\\G\u{FFFF}");
    }
}
