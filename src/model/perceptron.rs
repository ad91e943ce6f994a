//! Linear model over sparse indicator features, trained by the averaged
//! perceptron in [`crate::trainer`].

use std::path::Path;

use super::{
  Context, Expansion, Refinement, ScoringModel, Site, check_binary, check_lexical, check_top,
  check_unary, head_refinement, lookup_rule,
};
use crate::errors::{Error, Result, ScoreError};
use crate::features::{FeatureTable, extract, read_weights, write_weights};
use crate::grammar::Grammar;
use crate::rules::{CatId, Rule, RuleId};
use crate::utils::{Lookup, Score, log};

pub const NAME: &str = "perceptron";

/// `score(expansion) = Σ weight[f]` over the expansion's active features.
/// Features missing from the table weigh nothing.
#[derive(Debug, Clone)]
pub struct PerceptronModel {
  grammar_id: u32,
  table: FeatureTable,
  /// Empty until the model has been trained or loaded with weights.
  weights: Vec<f64>,
}

impl PerceptronModel {
  pub fn new(grammar: &Grammar) -> Self {
    Self {
      grammar_id: grammar.id(),
      table: FeatureTable::new(),
      weights: Vec::new(),
    }
  }

  pub fn table(&self) -> &FeatureTable {
    &self.table
  }

  pub fn table_mut(&mut self) -> &mut FeatureTable {
    &mut self.table
  }

  pub fn weights(&self) -> &[f64] {
    &self.weights
  }

  pub fn is_trained(&self) -> bool {
    !self.weights.is_empty()
  }

  pub fn weight(&self, idx: u32) -> f64 {
    self.weights.get(idx as usize).copied().unwrap_or(0.0)
  }

  pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
    if weights.len() != self.table.len() {
      return Err(Error::InvalidArgument(format!(
        "{} weights for {} features",
        weights.len(),
        self.table.len()
      )));
    }
    self.weights = weights;
    Ok(())
  }

  /// Feature indices of `expansion`, adding unseen features to the table.
  pub fn register(&mut self, ctx: &Context<'_>, expansion: &Expansion) -> Result<Vec<u32>, ScoreError> {
    let rule = lookup_rule(ctx, expansion.rule())?;
    let keys = extract(self.table.symbols_mut(), ctx, expansion, rule);
    Ok(keys.into_iter().filter_map(|k| self.table.register(k)).collect())
  }

  /// Feature indices of `expansion` that are already in the table.
  pub fn features(&self, ctx: &Context<'_>, expansion: &Expansion) -> Result<Vec<u32>, ScoreError> {
    let rule = lookup_rule(ctx, expansion.rule())?;
    Ok(self.lookup(ctx, expansion, rule))
  }

  fn lookup(&self, ctx: &Context<'_>, expansion: &Expansion, rule: &Rule) -> Vec<u32> {
    let mut symbols = Lookup(self.table.symbols());
    extract(&mut symbols, ctx, expansion, rule)
      .iter()
      .filter_map(|k| self.table.get(k))
      .collect()
  }

  fn local(&self, ctx: &Context<'_>, expansion: &Expansion, rule: &Rule) -> Score {
    self
      .lookup(ctx, expansion, rule)
      .into_iter()
      .map(|f| self.weight(f))
      .sum()
  }

  /// Writes the model's own weights; an untrained model is written with a
  /// length of `-1`.
  pub fn save(&self, grammar: &Grammar, path: impl AsRef<Path>) -> Result<()> {
    grammar.check(self.grammar_id)?;
    let weights = self.is_trained().then_some(self.weights.as_slice());
    write_weights(path, NAME, grammar, &self.table, weights)
  }

  /// Builds a model, table included, from a weight file.
  pub fn load(grammar: &Grammar, path: impl AsRef<Path>) -> Result<Self> {
    let mut model = Self::new(grammar);
    model.load_weights(grammar, path)?;
    Ok(model)
  }

  /// Reads weights for the features of this model's table. Features the file
  /// lists beyond the table are appended. A file written for an untrained
  /// model leaves the model untrained.
  pub fn load_weights(&mut self, grammar: &Grammar, path: impl AsRef<Path>) -> Result<()> {
    grammar.check(self.grammar_id)?;
    let path = path.as_ref();
    let (name, weights) = read_weights(path, grammar, &mut self.table)?;
    if name != NAME {
      return Err(Error::serialization(
        path,
        format!("expected a {} model, found {}", NAME, name),
      ));
    }
    self.weights = weights.unwrap_or_default();
    Ok(())
  }
}

impl ScoringModel for PerceptronModel {
  fn name(&self) -> &str {
    NAME
  }

  fn grammar_id(&self) -> u32 {
    self.grammar_id
  }

  fn refine_lexical(&self, _ctx: &Context<'_>, _cat: CatId, word: usize) -> Refinement {
    Refinement {
      head: Some(word as u32),
      lexcat: None,
    }
  }

  fn score_lexical(&self, ctx: &Context<'_>, rule: RuleId, site: &Site) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_lexical(r, site)?;
    Ok(self.local(ctx, &Expansion::Lexical { rule, site: *site }, r))
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
    Ok(self.local(ctx, &expansion, r))
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
    Ok(self.local(ctx, &expansion, r))
  }

  fn score_top(&self, ctx: &Context<'_>, rule: RuleId, root: &Site) -> Result<Score, ScoreError> {
    let r = lookup_rule(ctx, rule)?;
    check_top(r, root)?;
    Ok(self.local(ctx, &Expansion::Top { rule, root: *root }, r))
  }

  fn figure_of_merit(&self, _ctx: &Context<'_>, _site: &Site) -> Score {
    log::ONE
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::{Chart, Retain};
  use crate::derivation::viterbi;
  use crate::features::FeatureKey;
  use crate::model::{expansions, score_derivation};
  use crate::test_utils::*;

  #[test]
  fn test_score_is_sum_of_weights() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let mut model = PerceptronModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::Best, None).unwrap();
    let tree = viterbi(&chart).unwrap().tree;
    let ctx = Context::new(&g, &s);

    let steps = expansions(&model, &ctx, &tree).unwrap();
    let mut active = Vec::new();
    for step in steps.iter() {
      active.extend(model.register(&ctx, step).unwrap());
    }
    let weights = (0..model.table().len()).map(|i| 0.25 * i as f64).collect::<Vec<_>>();
    model.set_weights(weights.clone()).unwrap();

    let expected: f64 = active.iter().map(|f| weights[*f as usize]).sum();
    let total = score_derivation(&model, &ctx, &tree).unwrap();
    assert!((total - expected).abs() < 1e-9);
  }

  #[test]
  fn test_weights_steer_the_parse() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let mut model = PerceptronModel::new(&g);
    let adverb = g.cat_id("(S\\NP)\\(S\\NP)").unwrap();
    let postmod = g.cat_id("NP\\NP").unwrap();
    model.table_mut().register(FeatureKey::LexCat(adverb));
    model.table_mut().register(FeatureKey::LexCat(postmod));

    for (w, expected) in [(vec![1.0, -1.0], adverb), (vec![-1.0, 1.0], postmod)] {
      model.set_weights(w).unwrap();
      let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
      chart.fine(&model, Retain::Best, None).unwrap();
      let tree = viterbi(&chart).unwrap().tree;
      assert_eq!(tree.leaves()[3].value.cat, expected);
    }
  }

  #[test]
  fn test_save_and_load() {
    let g = toy_grammar();
    let mut model = PerceptronModel::new(&g);
    let n = g.cat_id("N").unwrap();
    model.table_mut().register(FeatureKey::LexCat(n));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model");

    model.save(&g, &path).unwrap();
    let untrained = PerceptronModel::load(&g, &path).unwrap();
    assert_eq!(untrained.table().len(), 1);
    assert_eq!(untrained.weight(0), 0.0);
    assert!(!untrained.is_trained());
    untrained.save(&g, &path).unwrap();
    let lines = std::fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().nth(1), Some("-1"));

    model.set_weights(vec![1.5]).unwrap();
    model.save(&g, &path).unwrap();
    let loaded = PerceptronModel::load(&g, &path).unwrap();
    assert_eq!(loaded.weights(), &[1.5]);
    assert_eq!(loaded.table().get(&FeatureKey::LexCat(n)), Some(0));

    std::fs::write(&path, "baseline\n-1\n").unwrap();
    assert!(matches!(
      PerceptronModel::load(&g, &path),
      Err(Error::Serialization { .. })
    ));
  }
}
