//! Derivation trees and Viterbi extraction.

use std::fmt;

use crate::chart::{Chart, FineBack, FineId};
use crate::grammar::Grammar;
use crate::rules::{CatId, RuleId};
use crate::syntree::{Constituent, SynTree, Word};
use crate::utils::Score;

/// The category built at a node and the rule that built it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
  pub cat: CatId,
  pub rule: RuleId,
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{} (rule {})", self.cat, self.rule)
  }
}

/// A CCG derivation. Leaves are words with their lexical category and rule;
/// branches have one (unary) or two (binary) children.
pub type Derivation = SynTree<Step, Step>;

/// A derivation together with its model score.
#[derive(Debug, Clone, PartialEq)]
pub struct Parse {
  pub tree: Derivation,
  pub score: Score,
}

/// The best derivation in a chart after a fine pass, if any root is admissible.
pub fn viterbi(chart: &Chart<'_>) -> Option<Parse> {
  let root = chart.roots().first()?;
  Some(Parse {
    tree: best_tree(chart, root.fine),
    score: root.score,
  })
}

/// Follows the best backpointer of every item below `fine`.
pub fn best_tree(chart: &Chart<'_>, fine: FineId) -> Derivation {
  let back = chart.fine_item(fine).edges[0].back;
  let children = back
    .children()
    .into_iter()
    .map(|c| best_tree(chart, c))
    .collect();
  node(chart, fine, back, children)
}

/// Builds the node for fine item `fine` expanded by `back` over already-built children.
pub(crate) fn node(chart: &Chart<'_>, fine: FineId, back: FineBack, children: Vec<Derivation>) -> Derivation {
  let item = chart.fine_item(fine);
  let step = Step {
    cat: item.site.cat,
    rule: back.rule(),
  };
  match back {
    FineBack::Lexical { .. } => SynTree::Leaf(Word {
      value: step,
      span: item.site.span,
    }),
    FineBack::Unary { .. } | FineBack::Binary { .. } => SynTree::Branch(
      Constituent {
        value: step,
        span: item.site.span,
      },
      children,
    ),
  }
}

/// A per-token lexical category, or a marker for a sentence without a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Supertag {
  Cat(CatId),
  Failure,
}

impl Supertag {
  pub fn display(&self, grammar: &Grammar) -> String {
    match self {
      Self::Cat(c) => grammar.cat_str(*c),
      Self::Failure => "FAILURE".to_string(),
    }
  }
}

/// Leaf categories of `tree`, or `len` failure markers without a tree.
pub fn lexical_categories(tree: Option<&Derivation>, len: usize) -> Vec<Supertag> {
  match tree {
    Some(t) => t.leaves().iter().map(|w| Supertag::Cat(w.value.cat)).collect(),
    None => vec![Supertag::Failure; len],
  }
}

/// Renders a derivation with category strings and combinator names.
pub fn render(grammar: &Grammar, tree: &Derivation) -> String {
  let name = |s: &Step| {
    let comb = grammar
      .rule(s.rule)
      .map(|r| r.combinator.as_str())
      .unwrap_or("?");
    format!("{} <{}>", grammar.cat_str(s.cat), comb)
  };
  tree
    .map(&|c: &Constituent<Step>| name(&c.value), &|w: &Word<Step>| name(&w.value))
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::Retain;
  use crate::test_utils::*;

  #[test]
  fn test_viterbi_the_dog_runs() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::Best, None).unwrap();
    let parse = viterbi(&chart).unwrap();

    assert_eq!(parse.tree.span(), crate::utils::Span::new(0, 3));
    assert_eq!(parse.tree.get_branch().unwrap().0.value.cat, g.cat_id("S").unwrap());
    let cats = lexical_categories(Some(&parse.tree), 3)
      .iter()
      .map(|t| t.display(&g))
      .collect::<Vec<_>>();
    assert_eq!(cats, vec!["NP/N", "N", "S\\NP"]);
    assert!(render(&g, &parse.tree).contains("S <ba>"));
  }

  #[test]
  fn test_failure_categories() {
    let tags = lexical_categories(None, 2);
    assert_eq!(tags, vec![Supertag::Failure, Supertag::Failure]);
  }

  #[test]
  fn test_viterbi_picks_best_root() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
    chart.fine(&model, Retain::All, None).unwrap();
    let parse = viterbi(&chart).unwrap();
    let total = crate::model::score_derivation(&model, &chart.context(), &parse.tree).unwrap();
    assert!((total - parse.score).abs() < 1e-9);
    for root in chart.roots() {
      assert!(root.score <= parse.score);
    }
  }
}
