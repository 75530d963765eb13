//! A TextMate grammar engine: grammars are compiled once into a [`Registry`], then
//! documents are tokenized line by line into spans of nested scopes.
//!
//! ```no_run
//! use tintex::Registry;
//!
//! let mut registry = Registry::default();
//! registry.add_grammar_from_path("apex.tmLanguage.yaml")?;
//! registry.link_grammars()?;
//!
//! let mut tokenizer = registry.tokenizer("Apex")?;
//! let first = tokenizer.tokenize_line("/* a comment", None)?;
//! let second = tokenizer.tokenize_line("ends here */", Some(&first.state))?;
//! assert_eq!(second.tokens[0].scopes.len(), 2);
//! # Ok::<(), tintex::Error>(())
//! ```

mod error;
mod grammars;
mod options;
mod registry;
mod scope;
mod tokenizer;

#[cfg(test)]
mod test_utils;

pub use error::Error;
pub use grammars::{
    CompiledGrammar, GlobalRuleRef, GrammarError, GrammarId, InjectionMatcher,
    InjectionPrecedence, RawGrammar, Rule, RuleId, parse_injection_selector,
};
pub use options::LoadOptions;
pub use registry::{PLAIN_GRAMMAR_NAME, Registry};
pub use scope::Scope;
pub use tokenizer::{LineTokens, StackFrame, StateStack, Token, Tokenizer};
