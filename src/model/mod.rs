//! The scoring-model interface used by the fine pass, and the pieces of chart
//! state that models see.

pub mod backoff;
pub mod generative;
pub mod perceptron;

use crate::derivation::Derivation;
use crate::errors::{Result, ScoreError};
use crate::grammar::Grammar;
use crate::rules::{CatId, Production, Rule, RuleId, Side};
use crate::sentence::Sentence;
use crate::syntree::SynTree;
use crate::utils::{Score, Span};

pub use generative::{BaselineModel, GenerativeModel, HeadWordModel, LexCatModel};
pub use perceptron::PerceptronModel;

/// Read-only state shared by every scoring call for one sentence.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
  pub grammar: &'a Grammar,
  pub sentence: &'a Sentence,
}

impl<'a> Context<'a> {
  pub fn new(grammar: &'a Grammar, sentence: &'a Sentence) -> Self {
    Self { grammar, sentence }
  }

  pub fn word(&self, idx: Option<u32>) -> Option<&'a str> {
    idx.map(|i| self.sentence.token(i as usize).word.as_str())
  }

  pub fn pos(&self, idx: Option<u32>) -> Option<&'a str> {
    idx.map(|i| self.sentence.token(i as usize).pos.as_str())
  }
}

/// Model-specific state distinguishing fine items of one coarse item.
///
/// The chart treats this as opaque: two fine items of the same coarse item are
/// the same item exactly when their refinements are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Refinement {
  /// Token index of the lexical head.
  pub head: Option<u32>,
  /// Lexical category of the head.
  pub lexcat: Option<CatId>,
}

/// A fine item as a model sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Site {
  pub cat: CatId,
  pub span: Span,
  pub refinement: Refinement,
}

impl Site {
  pub fn new(cat: CatId, span: Span, refinement: Refinement) -> Self {
    Self {
      cat,
      span,
      refinement,
    }
  }
}

/// One step of a derivation, with the sites involved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expansion {
  Lexical {
    rule: RuleId,
    site: Site,
  },
  Unary {
    rule: RuleId,
    parent: Site,
    child: Site,
  },
  Binary {
    rule: RuleId,
    parent: Site,
    left: Site,
    right: Site,
  },
  Top {
    rule: RuleId,
    root: Site,
  },
}

impl Expansion {
  pub fn rule(&self) -> RuleId {
    match self {
      Self::Lexical { rule, .. }
      | Self::Unary { rule, .. }
      | Self::Binary { rule, .. }
      | Self::Top { rule, .. } => *rule,
    }
  }
}

/// Distance bucket between two head positions: adjacent, 1, 2 and 3+ words apart.
pub fn distance_bin(a: Option<u32>, b: Option<u32>) -> u32 {
  match (a, b) {
    (Some(a), Some(b)) => a.abs_diff(b).saturating_sub(1).min(3),
    _ => 0,
  }
}

/// The head-word refinement most models share: heads percolate from the head child.
pub fn head_refinement(rule: &Rule, left: &Site, right: &Site) -> Refinement {
  match rule.head_side() {
    Some(Side::Right) => right.refinement,
    _ => left.refinement,
  }
}

pub(crate) fn check_lexical(rule: &Rule, site: &Site) -> Result<(), ScoreError> {
  match rule.production {
    Production::Terminal if rule.result == site.cat && site.span.len() == 1 => Ok(()),
    _ => Err(invalid(rule, site)),
  }
}

pub(crate) fn check_unary(rule: &Rule, parent: &Site, child: &Site) -> Result<(), ScoreError> {
  match rule.production {
    Production::Unary(c) if c == child.cat && rule.result == parent.cat && parent.span == child.span => {
      Ok(())
    }
    _ => Err(invalid(rule, parent)),
  }
}

pub(crate) fn check_binary(
  rule: &Rule,
  parent: &Site,
  left: &Site,
  right: &Site,
) -> Result<(), ScoreError> {
  match rule.production {
    Production::Binary(l, r)
      if l == left.cat
        && r == right.cat
        && rule.result == parent.cat
        && left.span.end == right.span.start =>
    {
      Ok(())
    }
    _ => Err(invalid(rule, parent)),
  }
}

pub(crate) fn check_top(rule: &Rule, root: &Site) -> Result<(), ScoreError> {
  match rule.production {
    Production::Unary(c) if c == root.cat => Ok(()),
    _ => Err(invalid(rule, root)),
  }
}

fn invalid(rule: &Rule, site: &Site) -> ScoreError {
  ScoreError::InvalidExpansion {
    rule: rule.id,
    parent: format!("cat #{} over {}", site.cat, site.span),
  }
}

pub(crate) fn lookup_rule<'a>(ctx: &Context<'a>, rule: RuleId) -> Result<&'a Rule, ScoreError> {
  ctx.grammar.rule(rule).ok_or(ScoreError::UnknownRule(rule))
}

/// Refines and scores chart expansions.
///
/// Implementations are shared read-only between parsing threads. `score_*`
/// returns [`log::ZERO`](crate::utils::log::ZERO) for admissible expansions the
/// model considers impossible, and a [`ScoreError`] for expansions that cannot
/// exist at all; the chart drops the latter.
pub trait ScoringModel: Send + Sync {
  fn name(&self) -> &str;

  /// Instance id of the grammar the model was built against.
  fn grammar_id(&self) -> u32;

  fn refine_lexical(&self, ctx: &Context<'_>, cat: CatId, word: usize) -> Refinement;

  fn score_lexical(&self, ctx: &Context<'_>, rule: RuleId, site: &Site) -> Result<Score, ScoreError>;

  fn refine_unary(&self, ctx: &Context<'_>, rule: RuleId, child: &Site) -> Refinement;

  fn score_unary(
    &self,
    ctx: &Context<'_>,
    rule: RuleId,
    parent: &Site,
    child: &Site,
  ) -> Result<Score, ScoreError>;

  fn refine_binary(&self, ctx: &Context<'_>, rule: RuleId, left: &Site, right: &Site) -> Refinement;

  fn score_binary(
    &self,
    ctx: &Context<'_>,
    rule: RuleId,
    parent: &Site,
    left: &Site,
    right: &Site,
  ) -> Result<Score, ScoreError>;

  fn score_top(&self, ctx: &Context<'_>, rule: RuleId, root: &Site) -> Result<Score, ScoreError>;

  /// A cheap ranking score, used only for beam pruning.
  fn figure_of_merit(&self, ctx: &Context<'_>, site: &Site) -> Score;

  /// Adds the events of a gold derivation to the model's statistics.
  /// Models trained some other way ignore this.
  fn accumulate_counts(&mut self, _ctx: &Context<'_>, _tree: &Derivation) -> Result<()> {
    Ok(())
  }

  fn score(&self, ctx: &Context<'_>, expansion: &Expansion) -> Result<Score, ScoreError> {
    match expansion {
      Expansion::Lexical { rule, site } => self.score_lexical(ctx, *rule, site),
      Expansion::Unary {
        rule,
        parent,
        child,
      } => self.score_unary(ctx, *rule, parent, child),
      Expansion::Binary {
        rule,
        parent,
        left,
        right,
      } => self.score_binary(ctx, *rule, parent, left, right),
      Expansion::Top { rule, root } => self.score_top(ctx, *rule, root),
    }
  }
}

/// Lists the expansions of a derivation bottom-up, refining every node with
/// `model`. The top expansion comes last.
pub fn expansions(
  model: &dyn ScoringModel,
  ctx: &Context<'_>,
  tree: &Derivation,
) -> std::result::Result<Vec<Expansion>, ScoreError> {
  let mut out = Vec::new();
  let root = walk(model, ctx, tree, &mut out)?;
  let rule = ctx
    .grammar
    .top_rule(root.cat)
    .ok_or(ScoreError::InvalidExpansion {
      rule: u32::MAX,
      parent: format!("cat #{} is not a start category", root.cat),
    })?;
  out.push(Expansion::Top { rule, root });
  Ok(out)
}

fn walk(
  model: &dyn ScoringModel,
  ctx: &Context<'_>,
  tree: &Derivation,
  out: &mut Vec<Expansion>,
) -> std::result::Result<Site, ScoreError> {
  match tree {
    SynTree::Leaf(w) => {
      let refinement = model.refine_lexical(ctx, w.value.cat, w.span.start);
      let site = Site::new(w.value.cat, w.span, refinement);
      out.push(Expansion::Lexical {
        rule: w.value.rule,
        site,
      });
      Ok(site)
    }
    SynTree::Branch(c, children) => match children.as_slice() {
      [child] => {
        let child = walk(model, ctx, child, out)?;
        let refinement = model.refine_unary(ctx, c.value.rule, &child);
        let parent = Site::new(c.value.cat, c.span, refinement);
        out.push(Expansion::Unary {
          rule: c.value.rule,
          parent,
          child,
        });
        Ok(parent)
      }
      [left, right] => {
        let left = walk(model, ctx, left, out)?;
        let right = walk(model, ctx, right, out)?;
        let refinement = model.refine_binary(ctx, c.value.rule, &left, &right);
        let parent = Site::new(c.value.cat, c.span, refinement);
        out.push(Expansion::Binary {
          rule: c.value.rule,
          parent,
          left,
          right,
        });
        Ok(parent)
      }
      _ => Err(ScoreError::InvalidExpansion {
        rule: c.value.rule,
        parent: format!("node over {} with {} children", c.span, children.len()),
      }),
    },
  }
}

/// Total model score of a derivation, including the top expansion.
pub fn score_derivation(
  model: &dyn ScoringModel,
  ctx: &Context<'_>,
  tree: &Derivation,
) -> std::result::Result<Score, ScoreError> {
  let mut total = crate::utils::log::ONE;
  for e in expansions(model, ctx, tree)? {
    total = crate::utils::log::mul(total, model.score(ctx, &e)?);
  }
  Ok(total)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::*;

  #[test]
  fn test_lookup_rule_borrows_the_grammar() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let lexical = g.lexical_rule(g.cat_id("N").unwrap()).unwrap();
    // the rule outlives the context it was looked up through
    let rule = {
      let ctx = Context::new(&g, &s);
      lookup_rule(&ctx, lexical).unwrap()
    };
    assert_eq!(rule.id, lexical);

    let ctx = Context::new(&g, &s);
    let unknown = g.rules().len() as RuleId;
    assert!(matches!(
      lookup_rule(&ctx, unknown),
      Err(ScoreError::UnknownRule(r)) if r == unknown
    ));
  }

  #[test]
  fn test_expansions_end_at_the_top() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let gold = "(<T S 1 2> (<T NP 1 2> (<L NP/N DT DT the NP/N>) (<L N NN NN dog N>) ) (<L S\\NP VBZ VBZ runs S\\NP>) )"
      .parse::<crate::auto::AutoNode>()
      .unwrap()
      .resolve(&g)
      .unwrap();
    let model = FixedModel::new(&g);
    let ctx = Context::new(&g, &s);
    let steps = expansions(&model, &ctx, &gold).unwrap();
    assert_eq!(steps.len(), 6);
    assert!(matches!(steps[5], Expansion::Top { .. }));
    let lexical = steps
      .iter()
      .filter(|e| matches!(e, Expansion::Lexical { .. }))
      .count();
    assert_eq!(lexical, 3);

    let total = score_derivation(&model, &ctx, &gold).unwrap();
    let expected: f64 = steps.iter().map(|e| model.score(&ctx, e).unwrap()).sum();
    assert!((total - expected).abs() < 1e-9);
  }
}
