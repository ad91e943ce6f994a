//! Lazy k-best extraction (Huang & Chiang 2005, algorithm 3).
//!
//! Every fine item gets a frontier of candidate derivations, each an edge plus
//! one rank per child. The best candidate is popped on demand and its
//! neighbours (one child rank bumped) are pushed, so only as many
//! sub-derivations are materialised as the requested derivations need.
//!
//! Ties are broken towards the edge kept first by the fine pass, then towards
//! lower child ranks. This makes the first derivation identical to
//! [`viterbi`](crate::derivation::viterbi).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use hashbrown::{HashMap, HashSet};

use crate::chart::{Chart, FineId};
use crate::derivation::{Derivation, Parse, node};
use crate::utils::{Score, log};

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
  score: Score,
  edge: usize,
  ranks: Vec<usize>,
}

impl Eq for Candidate {}

impl Ord for Candidate {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .score
      .total_cmp(&other.score)
      .then_with(|| other.edge.cmp(&self.edge))
      .then_with(|| other.ranks.cmp(&self.ranks))
  }
}

impl PartialOrd for Candidate {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

#[derive(Debug, Default)]
struct Frontier {
  found: Vec<Candidate>,
  heap: BinaryHeap<Candidate>,
  seen: HashSet<(usize, Vec<usize>)>,
}

/// Iterator over a chart's derivations in non-increasing score order.
///
/// Roots are treated as the edges of a virtual top node, so a root's fine item
/// may contribute several derivations.
pub struct KBest<'c, 'a> {
  chart: &'c Chart<'a>,
  frontiers: HashMap<FineId, Frontier>,
  top: Frontier,
}

impl<'c, 'a> KBest<'c, 'a> {
  pub fn new(chart: &'c Chart<'a>) -> Self {
    let mut top = Frontier::default();
    for (idx, root) in chart.roots().iter().enumerate() {
      top.seen.insert((idx, vec![0]));
      top.heap.push(Candidate {
        score: root.score,
        edge: idx,
        ranks: vec![0],
      });
    }
    Self {
      chart,
      frontiers: HashMap::new(),
      top,
    }
  }

  fn frontier(&mut self, fine: FineId) -> &mut Frontier {
    let chart = self.chart;
    self.frontiers.entry(fine).or_insert_with(|| {
      let mut frontier = Frontier::default();
      for (idx, edge) in chart.fine_item(fine).edges.iter().enumerate() {
        if log::is_zero(edge.score) {
          continue;
        }
        let ranks = vec![0; edge.back.children().len()];
        frontier.seen.insert((idx, ranks.clone()));
        frontier.heap.push(Candidate {
          score: edge.score,
          edge: idx,
          ranks,
        });
      }
      frontier
    })
  }

  /// Score of the `k`-th best derivation of `fine`, if it has that many.
  fn kth(&mut self, fine: FineId, k: usize) -> Option<Score> {
    loop {
      let frontier = self.frontier(fine);
      if frontier.found.len() > k {
        return Some(frontier.found[k].score);
      }
      if let Some(last) = frontier.found.last().cloned() {
        self.push_successors(fine, &last);
      }
      let frontier = self.frontier(fine);
      let next = frontier.heap.pop()?;
      frontier.found.push(next);
    }
  }

  fn push_successors(&mut self, fine: FineId, cand: &Candidate) {
    let chart = self.chart;
    let edge = chart.fine_item(fine).edges[cand.edge];
    let children = edge.back.children();
    for i in 0..children.len() {
      let mut ranks = cand.ranks.clone();
      ranks[i] += 1;
      if self.frontier(fine).seen.contains(&(cand.edge, ranks.clone())) {
        continue;
      }
      let mut score = edge.local;
      let mut complete = true;
      for (child, rank) in children.iter().zip(ranks.iter()) {
        match self.kth(*child, *rank) {
          Some(s) => score = log::mul(score, s),
          None => {
            complete = false;
            break;
          }
        }
      }
      let frontier = self.frontier(fine);
      frontier.seen.insert((cand.edge, ranks.clone()));
      if complete && !log::is_zero(score) {
        frontier.heap.push(Candidate {
          score,
          edge: cand.edge,
          ranks,
        });
      }
    }
  }

  /// The `k`-th best derivation of `fine`.
  fn tree(&mut self, fine: FineId, k: usize) -> Option<Derivation> {
    self.kth(fine, k)?;
    let cand = self.frontier(fine).found[k].clone();
    let chart = self.chart;
    let back = chart.fine_item(fine).edges[cand.edge].back;
    let mut children = Vec::with_capacity(cand.ranks.len());
    for (child, rank) in back.children().into_iter().zip(cand.ranks.iter()) {
      children.push(self.tree(child, *rank)?);
    }
    Some(node(chart, fine, back, children))
  }
}

impl Iterator for KBest<'_, '_> {
  type Item = Parse;

  fn next(&mut self) -> Option<Parse> {
    let roots = self.chart.roots();
    loop {
      let cand = self.top.heap.pop()?;
      let root = roots[cand.edge];
      let rank = cand.ranks[0];

      let succ = (cand.edge, vec![rank + 1]);
      if !self.top.seen.contains(&succ) {
        self.top.seen.insert(succ);
        if let Some(s) = self.kth(root.fine, rank + 1) {
          let score = log::mul(root.local, s);
          if !log::is_zero(score) {
            self.top.heap.push(Candidate {
              score,
              edge: cand.edge,
              ranks: vec![rank + 1],
            });
          }
        }
      }

      if let Some(tree) = self.tree(root.fine, rank) {
        return Some(Parse {
          tree,
          score: cand.score,
        });
      }
    }
  }
}

/// The `k` best derivations, best first.
pub fn k_best(chart: &Chart<'_>, k: usize) -> Vec<Parse> {
  KBest::new(chart).take(k).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chart::Retain;
  use crate::derivation::viterbi;
  use crate::model::score_derivation;
  use crate::test_utils::*;

  #[test]
  fn test_k_best_order_and_viterbi() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
    chart.fine(&model, Retain::KBest(10), None).unwrap();

    let parses = k_best(&chart, 10);
    assert!(parses.len() >= 2);
    for w in parses.windows(2) {
      assert!(w[0].score >= w[1].score);
    }
    for (i, a) in parses.iter().enumerate() {
      let total = score_derivation(&model, &chart.context(), &a.tree).unwrap();
      assert!((total - a.score).abs() < 1e-9);
      for b in parses[i + 1..].iter() {
        assert_ne!(a.tree, b.tree);
      }
    }
    assert_eq!(k_best(&chart, 1), vec![viterbi(&chart).unwrap()]);
  }

  #[test]
  fn test_k_best_on_viterbi_chart() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::Best, None).unwrap();
    let parses = k_best(&chart, 5);
    assert_eq!(parses.len(), 1);
    assert_eq!(parses[0], viterbi(&chart).unwrap());
  }

  #[test]
  fn test_ties_prefer_earlier_edges() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let model = FixedModel::flat(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
    chart.fine(&model, Retain::All, None).unwrap();
    let parses = k_best(&chart, 3);
    assert_eq!(parses[0], viterbi(&chart).unwrap());
    assert!(parses.iter().all(|p| p.score == parses[0].score));
  }
}
