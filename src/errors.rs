//! Error types shared by the whole crate.
//!
//! Anything that goes wrong inside a single sentence's dynamic program is *not*
//! an [`Error`]: it becomes a [`ParseFailure`](crate::parser::ParseFailure)
//! status at the sentence boundary. The variants here are for loading, saving,
//! construction and configuration problems.

use std::path::PathBuf;

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// A category string that the grammar's codebook does not know about.
  #[error("unknown category: {0}")]
  UnknownCategory(String),

  /// A category string that does not parse, or a grammar file that is inconsistent.
  #[error("malformed grammar: {0}")]
  MalformedGrammar(String),

  /// A gold derivation uses a step the grammar does not license.
  #[error("derivation not licensed by the grammar: {0}")]
  UnparseableByGrammar(String),

  /// Two objects built against different grammar instances were mixed.
  #[error("grammar mismatch: built against grammar #{expected}, used with grammar #{found}")]
  GrammarMismatch { expected: u32, found: u32 },

  /// A loaded weight file disagrees with the feature table it is loaded into.
  #[error("feature index mismatch at line {line}: {reason}")]
  FeatureIndexMismatch { line: usize, reason: String },

  /// A file was readable but its contents were not in the expected format.
  #[error("serialization error in {path}: {reason}")]
  Serialization { path: PathBuf, reason: String },

  /// A configuration value or call argument is out of range.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// A training record was moved through its stages out of order.
  #[error("invalid stage transition for sentence {sentence}: {from:?} -> {to:?}")]
  InvalidTransition {
    sentence: usize,
    from: crate::trainer::Stage,
    to: crate::trainer::Stage,
  },

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Encode(#[from] bincode::error::EncodeError),

  #[error(transparent)]
  Decode(#[from] bincode::error::DecodeError),

  #[error("background writer panicked: {0}")]
  ThreadPanic(String),
}

impl Error {
  pub(crate) fn serialization(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
    Self::Serialization {
      path: path.into(),
      reason: reason.into(),
    }
  }
}

/// A scoring call was asked to score an expansion that cannot exist.
///
/// This is different from a zero probability: [`log::ZERO`](crate::utils::log::ZERO)
/// is returned for admissible expansions the model has learned to be
/// (effectively) impossible, while a `ScoreError` drops the expansion entirely.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
  #[error("rule {rule} cannot produce {parent} from the given children")]
  InvalidExpansion { rule: u32, parent: String },

  #[error("unknown rule id {0}")]
  UnknownRule(u32),
}
