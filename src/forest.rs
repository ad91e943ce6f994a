//! Packed derivation forests for perceptron training.
//!
//! A forest is a snapshot of a fine chart built with every backpointer kept:
//! each node lists its edges, and each edge records its children and the
//! indices of the features active on it. Nodes are stored children-first, so
//! a single forward sweep computes inside scores. Nothing in a forest refers
//! to the chart, the sentence or the model, which is what lets the trainer
//! cache forests on disk and rescore them every epoch with new weights.

use bincode::{Decode, Encode};
use hashbrown::{HashMap, HashSet};

use crate::chart::{Chart, FineBack};
use crate::derivation::Derivation;
use crate::errors::{Error, Result, ScoreError};
use crate::model::{Expansion, PerceptronModel, expansions};
use crate::rules::{CatId, RuleId};
use crate::syntree::SynTree;
use crate::utils::{Score, Span, log};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ForestEdge {
  pub children: Vec<u32>,
  pub features: Vec<u32>,
  /// The edge is a step of the gold derivation over gold children.
  pub gold: bool,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ForestNode {
  pub edges: Vec<ForestEdge>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ForestRoot {
  pub node: u32,
  pub features: Vec<u32>,
  pub gold: bool,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct PackedForest {
  /// Position of the sentence in the training corpus.
  pub sentence: u32,
  pub nodes: Vec<ForestNode>,
  pub roots: Vec<ForestRoot>,
  /// Feature counts of the gold derivation, sorted by feature.
  pub gold: Vec<(u32, u32)>,
}

/// The highest-scoring derivation of a forest under some weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
  pub score: Score,
  /// Feature counts of the derivation, sorted by feature.
  pub features: Vec<(u32, u32)>,
  /// Every chosen edge, and the root, is gold.
  pub correct: bool,
}

/// Identifies a derivation step independently of any chart: the parent's
/// span and category, the rule, and where the children split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StepKey {
  span: Span,
  cat: CatId,
  rule: RuleId,
  children: Vec<Span>,
}

fn gold_steps(tree: &Derivation, out: &mut HashSet<StepKey>) {
  match tree {
    SynTree::Leaf(w) => {
      out.insert(StepKey {
        span: w.span,
        cat: w.value.cat,
        rule: w.value.rule,
        children: Vec::new(),
      });
    }
    SynTree::Branch(c, children) => {
      out.insert(StepKey {
        span: c.span,
        cat: c.value.cat,
        rule: c.value.rule,
        children: children.iter().map(|t| t.span()).collect(),
      });
      for child in children.iter() {
        gold_steps(child, out);
      }
    }
  }
}

fn count(features: impl IntoIterator<Item = u32>) -> Vec<(u32, u32)> {
  let mut counts: HashMap<u32, u32> = HashMap::new();
  for f in features {
    *counts.entry(f).or_insert(0) += 1;
  }
  let mut out = counts.into_iter().collect::<Vec<_>>();
  out.sort_unstable();
  out
}

fn weigh(weights: &[f64], features: &[u32]) -> Score {
  features
    .iter()
    .map(|f| weights.get(*f as usize).copied().unwrap_or(0.0))
    .sum()
}

impl PackedForest {
  /// Packs a chart whose fine pass ran with every backpointer retained,
  /// registering features with `model`'s table as it goes.
  ///
  /// Returns `Ok(None)` if the gold derivation is not in the chart.
  pub fn build(
    sentence: u32,
    chart: &Chart<'_>,
    model: &mut PerceptronModel,
    gold: &Derivation,
  ) -> Result<Option<Self>> {
    let ctx = chart.context();
    let grammar = chart.grammar();
    let unlicensed = |e: ScoreError| Error::UnparseableByGrammar(e.to_string());

    let gold_expansions = expansions(&*model, &ctx, gold).map_err(unlicensed)?;
    let mut gold_features = Vec::new();
    for e in gold_expansions.iter() {
      gold_features.extend(model.register(&ctx, e).map_err(unlicensed)?);
    }
    let mut steps = HashSet::new();
    gold_steps(gold, &mut steps);
    let gold_root = gold.span();
    let gold_cat = match gold {
      SynTree::Branch(c, _) => c.value.cat,
      SynTree::Leaf(w) => w.value.cat,
    };

    let mut nodes = Vec::with_capacity(chart.fine_items().len());
    let mut gold_nodes = Vec::with_capacity(chart.fine_items().len());
    for item in chart.fine_items() {
      let mut edges = Vec::with_capacity(item.edges.len());
      let mut any_gold = false;
      for edge in item.edges.iter() {
        let children = edge.back.children();
        let expansion = match edge.back {
          FineBack::Lexical { rule, .. } => Expansion::Lexical {
            rule,
            site: item.site,
          },
          FineBack::Unary { rule, child } => Expansion::Unary {
            rule,
            parent: item.site,
            child: chart.fine_item(child).site,
          },
          FineBack::Binary { rule, left, right } => Expansion::Binary {
            rule,
            parent: item.site,
            left: chart.fine_item(left).site,
            right: chart.fine_item(right).site,
          },
        };
        let key = StepKey {
          span: item.site.span,
          cat: item.site.cat,
          rule: edge.back.rule(),
          children: children.iter().map(|c| chart.fine_item(*c).site.span).collect(),
        };
        let gold = steps.contains(&key) && children.iter().all(|c| gold_nodes[*c as usize]);
        any_gold |= gold;
        edges.push(ForestEdge {
          children,
          features: model.register(&ctx, &expansion).map_err(unlicensed)?,
          gold,
        });
      }
      gold_nodes.push(any_gold);
      nodes.push(ForestNode { edges });
    }

    let mut roots = Vec::with_capacity(chart.roots().len());
    for root in chart.roots() {
      let site = chart.fine_item(root.fine).site;
      let features = model
        .register(
          &ctx,
          &Expansion::Top {
            rule: root.rule,
            root: site,
          },
        )
        .map_err(unlicensed)?;
      roots.push(ForestRoot {
        node: root.fine,
        features,
        gold: gold_nodes[root.fine as usize] && site.span == gold_root && site.cat == gold_cat,
      });
    }

    if !roots.iter().any(|r| r.gold) {
      tracing::debug!(
        sentence,
        root = %grammar.cat_str(gold_cat),
        "gold derivation not in forest"
      );
      return Ok(None);
    }
    Ok(Some(Self {
      sentence,
      nodes,
      roots,
      gold: count(gold_features),
    }))
  }

  pub fn num_edges(&self) -> usize {
    self.nodes.iter().map(|n| n.edges.len()).sum()
  }

  /// Viterbi over the forest. Ties go to the earlier edge or root.
  pub fn best(&self, weights: &[f64]) -> Option<Prediction> {
    let mut inside = Vec::with_capacity(self.nodes.len());
    let mut choice = Vec::with_capacity(self.nodes.len());
    for node in self.nodes.iter() {
      let mut best = (log::ZERO, usize::MAX);
      for (i, edge) in node.edges.iter().enumerate() {
        let score = edge
          .children
          .iter()
          .fold(weigh(weights, &edge.features), |acc, c| log::mul(acc, inside[*c as usize]));
        if best.1 == usize::MAX || score > best.0 {
          best = (score, i);
        }
      }
      inside.push(best.0);
      choice.push(best.1);
    }

    let mut top: Option<(Score, usize)> = None;
    for (i, root) in self.roots.iter().enumerate() {
      if choice[root.node as usize] == usize::MAX {
        continue;
      }
      let score = log::mul(weigh(weights, &root.features), inside[root.node as usize]);
      if top.is_none_or(|(s, _)| score > s) {
        top = Some((score, i));
      }
    }
    let (score, root_idx) = top?;
    let root = &self.roots[root_idx];

    let mut features = root.features.clone();
    let mut correct = root.gold;
    let mut stack = vec![root.node];
    while let Some(n) = stack.pop() {
      let edge = &self.nodes[n as usize].edges[choice[n as usize]];
      correct &= edge.gold;
      features.extend(edge.features.iter().copied());
      stack.extend(edge.children.iter().copied());
    }
    Some(Prediction {
      score,
      features: count(features),
      correct,
    })
  }

  /// Score of the gold derivation under `weights`.
  pub fn gold_score(&self, weights: &[f64]) -> Score {
    self
      .gold
      .iter()
      .map(|(f, n)| *n as f64 * weights.get(*f as usize).copied().unwrap_or(0.0))
      .sum()
  }

  /// Rewrites feature indices after the table was pruned; pruned features disappear.
  pub fn remap(&mut self, remap: &[Option<u32>]) {
    let apply = |features: &mut Vec<u32>| {
      *features = features
        .iter()
        .filter_map(|f| remap.get(*f as usize).copied().flatten())
        .collect();
    };
    for node in self.nodes.iter_mut() {
      for edge in node.edges.iter_mut() {
        apply(&mut edge.features);
      }
    }
    for root in self.roots.iter_mut() {
      apply(&mut root.features);
    }
    self.gold = self
      .gold
      .iter()
      .filter_map(|(f, n)| remap.get(*f as usize).copied().flatten().map(|g| (g, *n)))
      .collect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::Retain;
  use crate::kbest::k_best;
  use crate::test_utils::*;

  fn forest_for(leaf3: &str) -> (PackedForest, PerceptronModel) {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let mut model = PerceptronModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
    chart.fine(&model, Retain::All, None).unwrap();
    let target = g.cat_id(leaf3).unwrap();
    let gold = k_best(&chart, 10)
      .into_iter()
      .map(|p| p.tree)
      .find(|t| t.leaves()[3].value.cat == target)
      .unwrap();
    let forest = PackedForest::build(7, &chart, &mut model, &gold).unwrap().unwrap();
    (forest, model)
  }

  #[test]
  fn test_build_marks_gold() {
    let (forest, model) = forest_for("(S\\NP)\\(S\\NP)");
    assert_eq!(forest.sentence, 7);
    // both analyses are headed by "saw", so they pack into one root
    assert_eq!(forest.roots.len(), 1);
    assert!(forest.roots[0].gold);
    assert_eq!(forest.nodes[forest.roots[0].node as usize].edges.len(), 1);
    assert!(!forest.gold.is_empty());
    assert!(forest.num_edges() > 0);
    assert!(!model.table().is_empty());

    // the gold derivation's own features are exactly what a correct
    // prediction collects
    let mut weights = vec![0.0; model.table().len()];
    for (f, _) in forest.gold.iter() {
      weights[*f as usize] = 1.0;
    }
    let best = forest.best(&weights).unwrap();
    assert!(best.correct);
    assert_eq!(best.features, forest.gold);
    assert_eq!(best.score, forest.gold_score(&weights));
  }

  #[test]
  fn test_best_follows_weights() {
    let (forest, model) = forest_for("NP\\NP");
    let zeros = vec![0.0; model.table().len()];
    let first = forest.best(&zeros).unwrap();
    assert_eq!(first.score, 0.0);

    let mut weights = zeros.clone();
    for (f, _) in forest.gold.iter() {
      weights[*f as usize] = 0.5;
    }
    assert!(forest.best(&weights).unwrap().correct);
  }

  #[test]
  fn test_remap_drops_pruned_features() {
    let (mut forest, model) = forest_for("NP\\NP");
    let n = model.table().len();
    // keep only even features, compacted
    let remap = (0..n)
      .map(|i| (i % 2 == 0).then_some((i / 2) as u32))
      .collect::<Vec<_>>();
    forest.remap(&remap);
    let max = forest
      .nodes
      .iter()
      .flat_map(|n| n.edges.iter())
      .flat_map(|e| e.features.iter())
      .chain(forest.gold.iter().map(|(f, _)| f))
      .copied()
      .max()
      .unwrap();
    assert!((max as usize) < n.div_ceil(2));
  }
}
