mod common;
mod compiled;
mod injections;
mod pattern_set;
mod raw;
mod regex;

pub use common::Reference;
pub use compiled::*;
pub use injections::{InjectionMatcher, InjectionPrecedence, parse_injection_selector};
pub use pattern_set::{PatternSet, PatternSetMatch};
pub use raw::RawGrammar;
pub use regex::{CapturePositions, resolve_backreferences};
