//! Run counters: coverage, failure kinds, dependency and lexical-category accuracy.

use std::fmt;

use tracing::info;

use crate::deps::{DepSet, dependencies};
use crate::derivation::{Derivation, Supertag, lexical_categories};
use crate::grammar::Grammar;
use crate::parser::ParseFailure;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
  pub sentences: usize,
  pub parsed: usize,
  pub coarse_failures: usize,
  pub fine_failures: usize,
  pub abandoned: usize,
  /// Gold derivations the grammar cannot reproduce.
  pub unparseable: usize,
  pub gold_deps: usize,
  pub parser_deps: usize,
  pub correct_labeled: usize,
  pub correct_unlabeled: usize,
  pub gold_pairs: usize,
  pub parser_pairs: usize,
  pub tokens: usize,
  pub correct_tokens: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
  if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn f1(p: f64, r: f64) -> f64 {
  if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
}

impl ParseStats {
  pub fn new() -> Self {
    Self::default()
  }

  /// Counts one sentence. A failed sentence contributes no parser
  /// dependencies, but its gold dependencies and tokens still count.
  pub fn record(
    &mut self,
    grammar: &Grammar,
    len: usize,
    result: Result<&Derivation, ParseFailure>,
    gold: Option<&Derivation>,
  ) {
    self.sentences += 1;
    let parsed = match result {
      Ok(tree) => {
        self.parsed += 1;
        Some(tree)
      }
      Err(ParseFailure::Coarse) => {
        self.coarse_failures += 1;
        None
      }
      Err(ParseFailure::Fine) => {
        self.fine_failures += 1;
        None
      }
      Err(ParseFailure::Abandoned) => {
        self.abandoned += 1;
        None
      }
    };

    let ours = parsed.map(|t| dependencies(grammar, t)).unwrap_or_default();
    self.parser_deps += ours.len();
    self.parser_pairs += ours.pairs().len();

    let Some(gold) = gold else {
      return;
    };
    let theirs: DepSet = dependencies(grammar, gold);
    self.gold_deps += theirs.len();
    self.gold_pairs += theirs.pairs().len();
    self.correct_labeled += ours.labeled_matches(&theirs);
    self.correct_unlabeled += ours.unlabeled_matches(&theirs);

    let predicted = lexical_categories(parsed, len);
    let expected = lexical_categories(Some(gold), len);
    self.tokens += expected.len();
    self.correct_tokens += predicted
      .iter()
      .zip(expected.iter())
      .filter(|(p, e)| **p != Supertag::Failure && p == e)
      .count();
  }

  /// Counts a sentence whose gold derivation the grammar cannot reproduce.
  pub fn record_unparseable(&mut self) {
    self.sentences += 1;
    self.unparseable += 1;
  }

  pub fn merge(&mut self, other: &ParseStats) {
    self.sentences += other.sentences;
    self.parsed += other.parsed;
    self.coarse_failures += other.coarse_failures;
    self.fine_failures += other.fine_failures;
    self.abandoned += other.abandoned;
    self.unparseable += other.unparseable;
    self.gold_deps += other.gold_deps;
    self.parser_deps += other.parser_deps;
    self.correct_labeled += other.correct_labeled;
    self.correct_unlabeled += other.correct_unlabeled;
    self.gold_pairs += other.gold_pairs;
    self.parser_pairs += other.parser_pairs;
    self.tokens += other.tokens;
    self.correct_tokens += other.correct_tokens;
  }

  pub fn coverage(&self) -> f64 {
    ratio(self.parsed, self.sentences)
  }

  pub fn labeled_precision(&self) -> f64 {
    ratio(self.correct_labeled, self.parser_deps)
  }

  pub fn labeled_recall(&self) -> f64 {
    ratio(self.correct_labeled, self.gold_deps)
  }

  pub fn labeled_f1(&self) -> f64 {
    f1(self.labeled_precision(), self.labeled_recall())
  }

  pub fn unlabeled_f1(&self) -> f64 {
    f1(
      ratio(self.correct_unlabeled, self.parser_pairs),
      ratio(self.correct_unlabeled, self.gold_pairs),
    )
  }

  pub fn lexcat_accuracy(&self) -> f64 {
    ratio(self.correct_tokens, self.tokens)
  }

  pub fn log(&self) {
    info!(
      sentences = self.sentences,
      parsed = self.parsed,
      coarse_failures = self.coarse_failures,
      fine_failures = self.fine_failures,
      abandoned = self.abandoned,
      unparseable = self.unparseable,
      lf = self.labeled_f1(),
      uf = self.unlabeled_f1(),
      cats = self.lexcat_accuracy(),
      "parse statistics"
    );
  }
}

impl fmt::Display for ParseStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "coverage: {:.2}% ({} of {})",
      100.0 * self.coverage(),
      self.parsed,
      self.sentences
    )?;
    writeln!(
      f,
      "failures: {} coarse, {} fine, {} abandoned, {} unparseable",
      self.coarse_failures, self.fine_failures, self.abandoned, self.unparseable
    )?;
    writeln!(
      f,
      "labeled: P {:.2}% R {:.2}% F {:.2}% ({} correct, {} parser, {} gold)",
      100.0 * self.labeled_precision(),
      100.0 * self.labeled_recall(),
      100.0 * self.labeled_f1(),
      self.correct_labeled,
      self.parser_deps,
      self.gold_deps
    )?;
    writeln!(f, "unlabeled: F {:.2}%", 100.0 * self.unlabeled_f1())?;
    write!(
      f,
      "lexical categories: {:.2}% ({} of {})",
      100.0 * self.lexcat_accuracy(),
      self.correct_tokens,
      self.tokens
    )
  }
}
