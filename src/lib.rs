#[macro_use]
extern crate lazy_static;

pub mod auto;
pub mod category;
pub mod chart;
pub mod config;
pub mod deps;
pub mod derivation;
pub mod errors;
pub mod features;
pub mod forest;
pub mod grammar;
pub mod kbest;
pub mod model;
pub mod multitag;
pub mod parse_grammar;
pub mod parser;
pub mod rules;
pub mod sentence;
pub mod stats;
pub mod store;
pub mod syntree;
pub mod trainer;
pub mod utils;

pub use crate::auto::{AutoNode, read_auto};
pub use crate::category::Category;
pub use crate::chart::{Chart, Retain};
pub use crate::config::{ParserConfig, TrainerConfig};
pub use crate::deps::{DepSet, Dependency, dependencies};
pub use crate::derivation::{Derivation, Parse, Supertag, lexical_categories, viterbi};
pub use crate::errors::{Error, Result, ScoreError};
pub use crate::grammar::{Grammar, GrammarBuilder};
pub use crate::kbest::k_best;
pub use crate::model::{
  BaselineModel, HeadWordModel, LexCatModel, PerceptronModel, ScoringModel,
};
pub use crate::multitag::{Multitags, read_multitags};
pub use crate::parser::{ParseFailure, Parser};
pub use crate::sentence::{Sentence, Token};
pub use crate::stats::ParseStats;
pub use crate::store::Compression;
pub use crate::trainer::{Trainer, TrainingExample};

#[cfg(test)]
pub(crate) mod test_utils {
  use crate::errors::ScoreError;
  use crate::grammar::Grammar;
  use crate::model::{
    Context, Refinement, ScoringModel, Site, check_binary, check_lexical, check_top, check_unary,
    head_refinement, lookup_rule,
  };
  use crate::multitag::Multitags;
  use crate::rules::{CatId, Combinator, RuleId};
  use crate::sentence::{Sentence, Token};
  use crate::utils::{Score, log};

  /// `NP/N N S\NP` with forward and backward application.
  pub fn toy_grammar() -> Grammar {
    let mut b = Grammar::builder();
    for c in ["NP/N", "N", "S\\NP"] {
      b.lexical(c).unwrap();
    }
    b.category("NP").unwrap();
    b.start("S").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp]);
    b.build().unwrap()
  }

  pub fn the_dog_runs() -> Sentence {
    Sentence::new(vec![
      Token::new("the", "DT").with_gold("NP/N"),
      Token::new("dog", "NN").with_gold("N"),
      Token::new("runs", "VBZ").with_gold("S\\NP"),
    ])
  }

  pub fn the_dog_runs_tags(g: &Grammar) -> Multitags {
    Multitags::from_strs(g, &[&[("NP/N", 1.0)], &[("N", 1.0)], &[("S\\NP", 1.0)]]).unwrap()
  }

  /// "today" either modifies the verb phrase or the object.
  pub fn ambiguous_grammar() -> Grammar {
    let mut b = Grammar::builder();
    for c in ["NP", "N", "(S\\NP)/NP", "S\\NP", "(S\\NP)\\(S\\NP)", "NP\\NP"] {
      b.lexical(c).unwrap();
    }
    b.start("S").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp]);
    b.build().unwrap()
  }

  pub fn ambiguous_sentence() -> Sentence {
    Sentence::new(vec![
      Token::new("ducks", "NNS"),
      Token::new("saw", "VBD"),
      Token::new("ducks", "NNS"),
      Token::new("today", "NN"),
    ])
  }

  pub fn ambiguous_tags(g: &Grammar) -> Multitags {
    Multitags::from_strs(
      g,
      &[
        &[("NP", 1.0)],
        &[("(S\\NP)/NP", 0.8), ("S\\NP", 0.06)],
        &[("NP", 1.0)],
        &[("NP\\NP", 0.5), ("(S\\NP)\\(S\\NP)", 0.03)],
      ],
    )
    .unwrap()
  }

  /// Scores that depend only on rule and category ids, so tests can predict
  /// them: lexical `-0.1·(cat+1)`, binary `-0.1·(rule+1)`, unary `-0.5`.
  pub struct FixedModel {
    grammar_id: u32,
    flat: bool,
    /// Lexical expansions of this category score zero probability.
    pub zero_lexical: Option<CatId>,
  }

  impl FixedModel {
    pub fn new(g: &Grammar) -> Self {
      Self {
        grammar_id: g.id(),
        flat: false,
        zero_lexical: None,
      }
    }

    /// Every expansion scores `log::ONE`.
    pub fn flat(g: &Grammar) -> Self {
      Self {
        flat: true,
        ..Self::new(g)
      }
    }

    fn fixed(&self, score: Score) -> Score {
      if self.flat { log::ONE } else { score }
    }
  }

  impl ScoringModel for FixedModel {
    fn name(&self) -> &str {
      "fixed"
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
      check_lexical(lookup_rule(ctx, rule)?, site)?;
      if self.zero_lexical == Some(site.cat) {
        return Ok(log::ZERO);
      }
      Ok(self.fixed(-0.1 * (site.cat as f64 + 1.0)))
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
      check_unary(lookup_rule(ctx, rule)?, parent, child)?;
      Ok(self.fixed(-0.5))
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
      check_binary(lookup_rule(ctx, rule)?, parent, left, right)?;
      Ok(self.fixed(-0.1 * (rule as f64 + 1.0)))
    }

    fn score_top(&self, ctx: &Context<'_>, rule: RuleId, root: &Site) -> Result<Score, ScoreError> {
      check_top(lookup_rule(ctx, rule)?, root)?;
      Ok(log::ONE)
    }

    fn figure_of_merit(&self, _ctx: &Context<'_>, _site: &Site) -> Score {
      log::ONE
    }
  }
}

#[cfg(test)]
use crate::test_utils::*;

#[test]
fn test_the_dog_runs() {
  let g = toy_grammar();
  let s = the_dog_runs();
  let tags = the_dog_runs_tags(&g);
  let model = FixedModel::new(&g);
  let parser = Parser::new(&g, &model, ParserConfig::new().retain(Retain::All)).unwrap();

  let parses = parser.k_best(&s, &tags, 10).unwrap();
  assert_eq!(parses.len(), 1);
  let tree = &parses[0].tree;
  assert_eq!(tree.get_branch().unwrap().0.value.cat, g.cat_id("S").unwrap());

  let deps = dependencies(&g, tree);
  assert_eq!(
    deps.iter().copied().collect::<Vec<_>>(),
    vec![Dependency {
      target: 2,
      source: 1,
      cat: g.cat_id("S\\NP").unwrap(),
      slot: 1,
    }]
  );
  assert_eq!(deps.render(&g, &s).trim(), "runs_2 S\\NP 1 dog_1");
}

#[test]
fn test_missing_candidates_fail_at_every_beta() {
  let g = toy_grammar();
  let s = the_dog_runs();
  let tags = Multitags::from_strs(&g, &[&[("NP/N", 1.0)], &[], &[("S\\NP", 1.0)]]).unwrap();
  let model = FixedModel::new(&g);
  let parser = Parser::new(&g, &model, ParserConfig::new()).unwrap();
  let result = parser.parse(&s, &tags);
  assert_eq!(result.as_ref().err(), Some(&ParseFailure::Coarse));

  let gold = "(<T S 1 2> (<T NP 1 2> (<L NP/N DT DT the NP/N>) (<L N NN NN dog N>) ) (<L S\\NP VBZ VBZ runs S\\NP>) )"
    .parse::<AutoNode>()
    .unwrap()
    .resolve(&g)
    .unwrap();
  let mut stats = ParseStats::new();
  stats.record(&g, s.len(), result.as_ref().map(|p| &p.tree).map_err(|e| *e), Some(&gold));
  assert_eq!(stats.coarse_failures, 1);
  assert_eq!(stats.parser_deps, 0);
  assert_eq!(stats.gold_deps, 1);
  assert_eq!(
    lexical_categories(None, s.len()),
    vec![Supertag::Failure; 3]
  );
}

#[test]
fn test_generative_model_end_to_end() {
  let g = toy_grammar();
  let tree = "(<T S 1 2> (<T NP 1 2> (<L NP/N DT DT the NP/N>) (<L N NN NN dog N>) ) (<L S\\NP VBZ VBZ runs S\\NP>) )"
    .parse::<AutoNode>()
    .unwrap();
  let s = tree.sentence();
  let gold = tree.resolve(&g).unwrap();
  let model = HeadWordModel::estimate(&g, true, [(&s, &gold)]).unwrap();
  let tags = Multitags::from_gold(&g, &s).unwrap();

  let parser = Parser::new(&g, &model, ParserConfig::new()).unwrap();
  let corpus = vec![(s.clone(), tags.clone()), (s, tags)];
  let mut stats = ParseStats::new();
  for result in parser.parse_corpus(&corpus).unwrap() {
    stats.record(&g, 3, result.as_ref().map(|p| &p.tree).map_err(|e| *e), Some(&gold));
  }
  assert_eq!(stats.coverage(), 1.0);
  assert_eq!(stats.labeled_f1(), 1.0);
}
