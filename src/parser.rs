//! The coarse-to-fine driver: β retry ladder, fine pass, extraction, and
//! corpus-level parallelism.

use std::fmt;
use std::thread;

use tracing::{debug, trace, warn};

use crate::chart::Chart;
use crate::config::ParserConfig;
use crate::derivation::{Parse, viterbi};
use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::kbest::k_best;
use crate::model::ScoringModel;
use crate::multitag::Multitags;
use crate::sentence::Sentence;

/// Why a sentence got no derivation. These are per-sentence statuses, not
/// errors: a run keeps going and counts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseFailure {
  /// No start category spans the sentence at any β.
  Coarse,
  /// The coarse chart spans, but the model admits no root.
  Fine,
  /// Too long, or the chart outgrew its item budget.
  Abandoned,
}

impl fmt::Display for ParseFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Coarse => write!(f, "coarse parse failure"),
      Self::Fine => write!(f, "fine parse failure"),
      Self::Abandoned => write!(f, "abandoned"),
    }
  }
}

/// Coarse pass over `config`'s β ladder. Each β rebuilds the chart from
/// scratch; the first chart in which a start category spans the sentence wins.
pub fn coarse_chart<'s>(
  grammar: &'s Grammar,
  sentence: &'s Sentence,
  tags: &Multitags,
  config: &ParserConfig,
) -> Result<Chart<'s>, ParseFailure> {
  if sentence.len() > config.max_sentence_len {
    debug!(words = sentence.len(), "sentence too long, abandoning");
    return Err(ParseFailure::Abandoned);
  }
  for beta in config.betas.iter().copied() {
    match Chart::coarse(grammar, sentence, tags, beta, config.max_items) {
      Ok(chart) => {
        trace!(beta, items = chart.coarse_items().len(), "coarse parse");
        return Ok(chart);
      }
      Err(ParseFailure::Coarse) => debug!(beta, "no spanning analysis, widening beam"),
      Err(other) => return Err(other),
    }
  }
  Err(ParseFailure::Coarse)
}

/// Parses sentences with one grammar and one model. Both are shared
/// read-only, so a `Parser` can be used from several threads at once.
pub struct Parser<'a> {
  grammar: &'a Grammar,
  model: &'a dyn ScoringModel,
  config: ParserConfig,
}

impl<'a> Parser<'a> {
  pub fn new(grammar: &'a Grammar, model: &'a dyn ScoringModel, config: ParserConfig) -> Result<Self> {
    config.validate()?;
    grammar.check(model.grammar_id())?;
    Ok(Self {
      grammar,
      model,
      config,
    })
  }

  pub fn grammar(&self) -> &'a Grammar {
    self.grammar
  }

  pub fn model(&self) -> &'a dyn ScoringModel {
    self.model
  }

  pub fn config(&self) -> &ParserConfig {
    &self.config
  }

  /// Coarse pass over the β ladder; see [`coarse_chart`].
  pub fn coarse<'s>(&self, sentence: &'s Sentence, tags: &Multitags) -> Result<Chart<'s>, ParseFailure>
  where
    'a: 's,
  {
    coarse_chart(self.grammar, sentence, tags, &self.config)
  }

  /// Coarse pass plus fine pass. The returned chart has at least one root.
  pub fn chart<'s>(&self, sentence: &'s Sentence, tags: &Multitags) -> Result<Chart<'s>, ParseFailure>
  where
    'a: 's,
  {
    let mut chart = self.coarse(sentence, tags)?;
    if let Err(e) = chart.fine(self.model, self.config.retain, self.config.fine_beam) {
      warn!(%e, "fine pass rejected");
      return Err(ParseFailure::Fine);
    }
    if chart.has_parse() {
      Ok(chart)
    } else {
      debug!(beta = chart.beta(), "no admissible root");
      Err(ParseFailure::Fine)
    }
  }

  /// The best derivation.
  pub fn parse(&self, sentence: &Sentence, tags: &Multitags) -> Result<Parse, ParseFailure> {
    let chart = self.chart(sentence, tags)?;
    viterbi(&chart).ok_or(ParseFailure::Fine)
  }

  /// Up to `k` derivations, best first. How many distinct derivations exist
  /// depends on the configured retention mode.
  pub fn k_best(&self, sentence: &Sentence, tags: &Multitags, k: usize) -> Result<Vec<Parse>, ParseFailure> {
    let chart = self.chart(sentence, tags)?;
    Ok(k_best(&chart, k))
  }

  /// Parses a corpus on `num_threads` scoped threads over contiguous chunks.
  /// Results come back in input order.
  pub fn parse_corpus(&self, corpus: &[(Sentence, Multitags)]) -> Result<Vec<Result<Parse, ParseFailure>>> {
    let threads = self.config.num_threads.min(corpus.len()).max(1);
    if threads == 1 {
      return Ok(corpus.iter().map(|(s, t)| self.parse(s, t)).collect());
    }
    let chunk = corpus.len().div_ceil(threads);
    thread::scope(|scope| {
      let handles = corpus
        .chunks(chunk)
        .map(|part| {
          scope.spawn(move || part.iter().map(|(s, t)| self.parse(s, t)).collect::<Vec<_>>())
        })
        .collect::<Vec<_>>();
      let mut out = Vec::with_capacity(corpus.len());
      for handle in handles {
        let part = handle
          .join()
          .map_err(|_| Error::ThreadPanic("parser thread".to_string()))?;
        out.extend(part);
      }
      Ok(out)
    })
  }
}
