use std::fmt;
use std::io;

use crate::grammars::GrammarError;

pub(crate) type TintexResult<T> = Result<T, Error>;

/// Errors that can occur when loading grammars or tokenizing with them
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred when reading a grammar file
    /// or a dump file if the `dump` feature is enabled
    Io(io::Error),

    /// JSON parsing failed when loading a grammar or a JSON dump
    Json(serde_json::Error),

    /// YAML parsing failed when loading a grammar
    Yaml(serde_yaml::Error),

    /// Encoding or decoding a binary dump failed
    #[cfg(feature = "dump")]
    Dump(String),

    /// A grammar failed validation. Nothing from it was added to the registry.
    InvalidGrammar {
        #[allow(missing_docs)]
        grammar: String,
        #[allow(missing_docs)]
        source: GrammarError,
    },

    /// A grammar was not found in the registry.
    GrammarNotFound(String),

    /// `Registry::link_grammars` needs to be called before tokenizing
    UnlinkedGrammars,

    /// Grammars can't be added or replaced once the registry has been linked
    ReplacingGrammarPostLinking(String),

    /// The state given to the tokenizer was produced by another registry or grammar
    ForeignState,

    /// A registry holds at most 65535 grammars, shadowed ones included
    TooManyGrammars,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Json(err) => write!(f, "JSON parsing error: {err}"),
            Error::Yaml(err) => write!(f, "YAML parsing error: {err}"),
            #[cfg(feature = "dump")]
            Error::Dump(message) => write!(f, "binary dump error: {message}"),
            Error::InvalidGrammar { grammar, source } => {
                write!(f, "invalid grammar '{grammar}': {source}")
            }
            Error::GrammarNotFound(name) => write!(f, "grammar '{name}' not found"),
            Error::UnlinkedGrammars => write!(
                f,
                "the registry needs to be linked with `link_grammars` before tokenizing"
            ),
            Error::ReplacingGrammarPostLinking(name) => write!(
                f,
                "cannot add or replace grammar '{name}' after the registry was linked"
            ),
            Error::ForeignState => write!(
                f,
                "the state stack was created by another registry or for another grammar"
            ),
            Error::TooManyGrammars => write!(f, "too many grammars in the registry"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Yaml(err) => Some(err),
            Error::InvalidGrammar { source, .. } => Some(source),
            #[cfg(feature = "dump")]
            Error::Dump(_) => None,
            Error::GrammarNotFound(_)
            | Error::UnlinkedGrammars
            | Error::ReplacingGrammarPostLinking(_)
            | Error::ForeignState
            | Error::TooManyGrammars => None,
        }
    }
}

impl Error {
    /// The grammar validation error, if that's what this is
    pub fn grammar_error(&self) -> Option<&GrammarError> {
        match self {
            Error::InvalidGrammar { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err)
    }
}

#[cfg(feature = "dump")]
impl From<bitcode::Error> for Error {
    fn from(err: bitcode::Error) -> Self {
        Error::Dump(err.to_string())
    }
}
