//! Generative top-down models of derivations.
//!
//! A node first picks an expansion (leaf, unary, or binary with the head on
//! the left or right), then its head child's category, then the sibling's.
//! Leaves generate their word. The three variants differ only in how much of
//! the parent is in the conditioning context:
//!
//! - [`BaselineModel`]: the parent category.
//! - [`LexCatModel`]: plus the lexical category of its head.
//! - [`HeadWordModel`]: plus the head's POS tag and word. Siblings also
//!   generate their head word.
//!
//! Any of them can additionally condition sibling choice on the distance
//! between the two heads.

use std::marker::PhantomData;

use hashbrown::HashMap;
use tracing::debug;

use super::backoff::Backoff;
use super::{
  Context, Expansion, Refinement, ScoringModel, Site, check_binary, check_lexical, check_top,
  check_unary, distance_bin, expansions, head_refinement, lookup_rule,
};
use crate::derivation::Derivation;
use crate::errors::{Error, Result, ScoreError};
use crate::grammar::Grammar;
use crate::rules::{CatId, Rule, RuleId, Side};
use crate::sentence::Sentence;
use crate::utils::{Lookup, Score, SymbolSource, Symbols, log};

/// Outcome and context markers. They sit at the top of the id space, far
/// above any category or symbol id.
pub const LEX: u32 = u32::MAX;
pub const LEFT: u32 = u32::MAX - 1;
pub const RIGHT: u32 = u32::MAX - 2;
pub const UNARY: u32 = u32::MAX - 3;
pub const TOP: u32 = u32::MAX - 4;
pub const NONE: u32 = u32::MAX - 5;
pub const UNK: u32 = u32::MAX - 6;

/// How much of a node the model conditions on.
pub trait Conditioning: Send + Sync + 'static {
  const NAME: &'static str;
  const LEXCAT: bool;
  const WORDS: bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline;

impl Conditioning for Baseline {
  const NAME: &'static str = "baseline";
  const LEXCAT: bool = false;
  const WORDS: bool = false;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LexCat;

impl Conditioning for LexCat {
  const NAME: &'static str = "lexcat";
  const LEXCAT: bool = true;
  const WORDS: bool = false;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeadWord;

impl Conditioning for HeadWord {
  const NAME: &'static str = "headword";
  const LEXCAT: bool = true;
  const WORDS: bool = true;
}

pub type BaselineModel = GenerativeModel<Baseline>;
pub type LexCatModel = GenerativeModel<LexCat>;
pub type HeadWordModel = GenerativeModel<HeadWord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dist {
  Expansion,
  Head,
  Sibling,
  SiblingWord,
  Word,
  Top,
}

#[derive(Debug, Clone, PartialEq)]
struct Event {
  dist: Dist,
  context: Vec<u32>,
  outcome: u32,
}

#[derive(Debug, Clone)]
pub struct GenerativeModel<C> {
  grammar_id: u32,
  distance: bool,
  words: Symbols,
  tags: Symbols,
  expansion: Backoff,
  head: Backoff,
  sibling: Backoff,
  sibling_word: Backoff,
  word: Backoff,
  top: Backoff,
  prior: HashMap<CatId, u64>,
  prior_total: u64,
  _conditioning: PhantomData<C>,
}

impl<C: Conditioning> GenerativeModel<C> {
  /// An untrained model. With `distance`, sibling categories are also
  /// conditioned on how far apart the two heads are.
  pub fn new(grammar: &Grammar, distance: bool) -> Self {
    let extra = C::LEXCAT as usize + 2 * C::WORDS as usize;
    Self {
      grammar_id: grammar.id(),
      distance,
      words: Symbols::new(),
      tags: Symbols::new(),
      expansion: Backoff::chain(1 + extra, 1),
      head: Backoff::chain(2 + extra, 2),
      sibling: Backoff::chain(3 + distance as usize + extra, 3),
      sibling_word: Backoff::chain(5, 1),
      word: Backoff::chain(2, 1),
      top: Backoff::chain(1, 1),
      prior: HashMap::new(),
      prior_total: 0,
      _conditioning: PhantomData,
    }
  }

  /// Counts every derivation of a gold corpus.
  pub fn estimate<'s>(
    grammar: &Grammar,
    distance: bool,
    corpus: impl IntoIterator<Item = (&'s Sentence, &'s Derivation)>,
  ) -> Result<Self> {
    let mut model = Self::new(grammar, distance);
    let mut n = 0;
    for (sentence, tree) in corpus {
      model.accumulate_counts(&Context::new(grammar, sentence), tree)?;
      n += 1;
    }
    debug!(model = C::NAME, sentences = n, "estimated generative model");
    Ok(model)
  }

  pub fn distance(&self) -> bool {
    self.distance
  }

  fn refines_heads(&self) -> bool {
    C::WORDS || self.distance
  }

  fn dist(&self, dist: Dist) -> &Backoff {
    match dist {
      Dist::Expansion => &self.expansion,
      Dist::Head => &self.head,
      Dist::Sibling => &self.sibling,
      Dist::SiblingWord => &self.sibling_word,
      Dist::Word => &self.word,
      Dist::Top => &self.top,
    }
  }

  fn dist_mut(&mut self, dist: Dist) -> &mut Backoff {
    match dist {
      Dist::Expansion => &mut self.expansion,
      Dist::Head => &mut self.head,
      Dist::Sibling => &mut self.sibling,
      Dist::SiblingWord => &mut self.sibling_word,
      Dist::Word => &mut self.word,
      Dist::Top => &mut self.top,
    }
  }

  fn total(&self, ctx: &Context<'_>, expansion: &Expansion, rule: &Rule) -> Score {
    let mut words = Lookup(&self.words);
    let mut tags = Lookup(&self.tags);
    events::<C>(self.distance, &mut words, &mut tags, ctx, expansion, rule)
      .iter()
      .fold(log::ONE, |acc, e| {
        log::mul(acc, self.dist(e.dist).log_prob(&e.context, e.outcome))
      })
  }
}

fn symbol(source: &mut dyn SymbolSource, s: Option<&str>) -> u32 {
  match s {
    Some(s) => source.symbol(s).unwrap_or(UNK),
    None => NONE,
  }
}

/// The conditioning information a variant adds for `site`.
fn extra<C: Conditioning>(
  words: &mut dyn SymbolSource,
  tags: &mut dyn SymbolSource,
  ctx: &Context<'_>,
  site: &Site,
) -> Vec<u32> {
  let mut out = Vec::with_capacity(3);
  if C::LEXCAT {
    out.push(site.refinement.lexcat.unwrap_or(NONE));
  }
  if C::WORDS {
    out.push(symbol(tags, ctx.pos(site.refinement.head)));
    out.push(symbol(words, ctx.word(site.refinement.head)));
  }
  out
}

fn context(prefix: &[u32], extra: &[u32]) -> Vec<u32> {
  let mut out = Vec::with_capacity(prefix.len() + extra.len());
  out.extend_from_slice(prefix);
  out.extend_from_slice(extra);
  out
}

/// The generative events one expansion contributes.
fn events<C: Conditioning>(
  distance: bool,
  words: &mut dyn SymbolSource,
  tags: &mut dyn SymbolSource,
  ctx: &Context<'_>,
  expansion: &Expansion,
  rule: &Rule,
) -> Vec<Event> {
  let event = |dist, context, outcome| Event {
    dist,
    context,
    outcome,
  };
  match expansion {
    Expansion::Lexical { site, .. } => {
      let token = ctx.sentence.token(site.span.start);
      let e = extra::<C>(words, tags, ctx, site);
      let tag = symbol(tags, Some(token.pos.as_str()));
      let word = symbol(words, Some(token.word.as_str()));
      vec![
        event(Dist::Expansion, context(&[site.cat], &e), LEX),
        event(Dist::Word, vec![site.cat, tag], word),
      ]
    }
    Expansion::Unary { parent, child, .. } => {
      let e = extra::<C>(words, tags, ctx, parent);
      vec![
        event(Dist::Expansion, context(&[parent.cat], &e), UNARY),
        event(Dist::Head, context(&[parent.cat, UNARY], &e), child.cat),
      ]
    }
    Expansion::Binary {
      parent,
      left,
      right,
      ..
    } => {
      let (head, sibling, exp) = match rule.head_side() {
        Some(Side::Right) => (right, left, RIGHT),
        _ => (left, right, LEFT),
      };
      let e = extra::<C>(words, tags, ctx, parent);
      let mut sibling_context = vec![parent.cat, exp, head.cat];
      if distance {
        sibling_context.push(distance_bin(left.refinement.head, right.refinement.head));
      }
      let mut out = vec![
        event(Dist::Expansion, context(&[parent.cat], &e), exp),
        event(Dist::Head, context(&[parent.cat, exp], &e), head.cat),
        event(Dist::Sibling, context(&sibling_context, &e), sibling.cat),
      ];
      if C::WORDS {
        let sibling_tag = symbol(tags, ctx.pos(sibling.refinement.head));
        let sibling_word = symbol(words, ctx.word(sibling.refinement.head));
        let head_word = symbol(words, ctx.word(head.refinement.head));
        out.push(event(
          Dist::SiblingWord,
          vec![sibling.cat, sibling_tag, parent.cat, head.cat, head_word],
          sibling_word,
        ));
      }
      out
    }
    Expansion::Top { root, .. } => vec![event(Dist::Top, vec![TOP], root.cat)],
  }
}

impl<C: Conditioning> ScoringModel for GenerativeModel<C> {
  fn name(&self) -> &str {
    C::NAME
  }

  fn grammar_id(&self) -> u32 {
    self.grammar_id
  }

  fn refine_lexical(&self, _ctx: &Context<'_>, cat: CatId, word: usize) -> Refinement {
    Refinement {
      head: self.refines_heads().then_some(word as u32),
      lexcat: C::LEXCAT.then_some(cat),
    }
  }

  fn score_lexical(&self, ctx: &Context<'_>, rule: RuleId, site: &Site) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_lexical(r, site)?;
    Ok(self.total(ctx, &Expansion::Lexical { rule, site: *site }, r))
  }

  fn refine_unary(&self, _ctx: &Context<'_>, _rule: RuleId, child: &Site) -> Refinement {
    child.refinement
  }

  fn score_unary(
    &self,
    ctx: &Context<'_>,
    rule: RuleId,
    parent: &Site,
    child: &Site,
  ) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_unary(r, parent, child)?;
    let expansion = Expansion::Unary {
      rule,
      parent: *parent,
      child: *child,
    };
    Ok(self.total(ctx, &expansion, r))
  }

  fn refine_binary(&self, ctx: &Context<'_>, rule: RuleId, left: &Site, right: &Site) -> Refinement {
    match ctx.grammar.rule(rule) {
      Some(r) => head_refinement(r, left, right),
      None => Refinement::default(),
    }
  }

  fn score_binary(
    &self,
    ctx: &Context<'_>,
    rule: RuleId,
    parent: &Site,
    left: &Site,
    right: &Site,
  ) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_binary(r, parent, left, right)?;
    let expansion = Expansion::Binary {
      rule,
      parent: *parent,
      left: *left,
      right: *right,
    };
    Ok(self.total(ctx, &expansion, r))
  }

  fn score_top(&self, ctx: &Context<'_>, rule: RuleId, root: &Site) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_top(r, root)?;
    Ok(self.total(ctx, &Expansion::Top { rule, root: *root }, r))
  }

  /// Add-one smoothed unigram prior over categories.
  fn figure_of_merit(&self, ctx: &Context<'_>, site: &Site) -> Score {
    let seen = self.prior.get(&site.cat).copied().unwrap_or(0) as f64;
    let total = self.prior_total as f64 + ctx.grammar.num_categories() as f64;
    log::from_prob((seen + 1.0) / total)
  }

  fn accumulate_counts(&mut self, ctx: &Context<'_>, tree: &Derivation) -> Result<()> {
    ctx.grammar.check(self.grammar_id)?;
    let steps = expansions(&*self, ctx, tree).map_err(|e| Error::UnparseableByGrammar(e.to_string()))?;
    for step in steps.iter() {
      let rule = ctx
        .grammar
        .rule(step.rule())
        .ok_or_else(|| Error::UnparseableByGrammar(format!("unknown rule {}", step.rule())))?;
      let found = events::<C>(self.distance, &mut self.words, &mut self.tags, ctx, step, rule);
      for e in found {
        self.dist_mut(e.dist).observe(&e.context, e.outcome);
      }
      let cat = match step {
        Expansion::Lexical { site, .. } => Some(site.cat),
        Expansion::Unary { parent, .. } | Expansion::Binary { parent, .. } => Some(parent.cat),
        Expansion::Top { .. } => None,
      };
      if let Some(cat) = cat {
        *self.prior.entry(cat).or_insert(0) += 1;
        self.prior_total += 1;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{Chart, Retain};
  use crate::derivation::{lexical_categories, viterbi};
  use crate::kbest::k_best;
  use crate::model::score_derivation;
  use crate::test_utils::*;

  /// The analysis of the ambiguous sentence where "today" modifies the verb phrase.
  fn adverbial_parse(g: &Grammar) -> Derivation {
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(g);
    let mut chart = Chart::coarse(g, &s, &tags, 0.005, 10_000).unwrap();
    chart.fine(&FixedModel::flat(g), Retain::All, None).unwrap();
    let adverb = g.cat_id("(S\\NP)\\(S\\NP)").unwrap();
    k_best(&chart, 10)
      .into_iter()
      .map(|p| p.tree)
      .find(|t| t.leaves()[3].value.cat == adverb)
      .unwrap()
  }

  #[test]
  fn test_trained_models_prefer_the_observed_analysis() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let gold = adverbial_parse(&g);
    let tags = ambiguous_tags(&g);

    let baseline = BaselineModel::estimate(&g, false, [(&s, &gold)]).unwrap();
    let lexcat = LexCatModel::estimate(&g, false, [(&s, &gold)]).unwrap();
    let headword = HeadWordModel::estimate(&g, true, [(&s, &gold)]).unwrap();
    let models: [&dyn ScoringModel; 3] = [&baseline, &lexcat, &headword];
    for model in models {
      let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
      chart.fine(model, Retain::Best, None).unwrap();
      let best = viterbi(&chart).unwrap();
      assert_eq!(best.tree, gold, "{}", model.name());
      assert!(best.score < 0.0);
      let total = score_derivation(model, &chart.context(), &gold).unwrap();
      assert!((total - best.score).abs() < 1e-9);
    }
  }

  #[test]
  fn test_untrained_model_scores_are_finite() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let model = HeadWordModel::new(&g, false);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::Best, None).unwrap();
    let best = viterbi(&chart).unwrap();
    assert!(best.score.is_finite());
    let cats = lexical_categories(Some(&best.tree), s.len())
      .iter()
      .map(|c| c.display(&g))
      .collect::<Vec<_>>();
    assert_eq!(cats, vec!["NP/N", "N", "S\\NP"]);
  }

  #[test]
  fn test_head_refinements() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let ctx = Context::new(&g, &s);
    let n = g.cat_id("N").unwrap();
    assert_eq!(BaselineModel::new(&g, false).refine_lexical(&ctx, n, 1), Refinement::default());
    assert_eq!(
      BaselineModel::new(&g, true).refine_lexical(&ctx, n, 1).head,
      Some(1)
    );
    let r = HeadWordModel::new(&g, false).refine_lexical(&ctx, n, 1);
    assert_eq!((r.head, r.lexcat), (Some(1), Some(n)));
  }

  #[test]
  fn test_prior_ranks_frequent_categories() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let gold = adverbial_parse(&g);
    let model = LexCatModel::estimate(&g, false, [(&s, &gold)]).unwrap();
    let ctx = Context::new(&g, &s);
    let site = |cat: &str| Site::new(g.cat_id(cat).unwrap(), crate::utils::Span::new(0, 1), Refinement::default());
    assert!(model.figure_of_merit(&ctx, &site("NP")) > model.figure_of_merit(&ctx, &site("NP\\NP")));
  }

  #[test]
  fn test_foreign_grammar_is_rejected() {
    let g = toy_grammar();
    let other = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&FixedModel::new(&g), Retain::Best, None).unwrap();
    let tree = viterbi(&chart).unwrap().tree;
    let mut model = BaselineModel::new(&other, false);
    assert!(matches!(
      model.accumulate_counts(&Context::new(&g, &s), &tree),
      Err(Error::GrammarMismatch { .. })
    ));
  }
}
