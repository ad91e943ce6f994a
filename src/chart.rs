//! The per-sentence chart.
//!
//! The coarse pass is a CKY over categories only: each cell maps a category
//! (and unary level) to one coarse item packing every way of building it. The
//! fine pass then walks the coarse items bottom-up and asks a
//! [`ScoringModel`] to split them into refined, scored fine items. Fine items
//! live in one arena and are created children-first, so a fine id is always
//! larger than the ids of the items it was built from.

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::errors::Result;
use crate::grammar::Grammar;
use crate::model::{Context, Refinement, ScoringModel, Site};
use crate::multitag::Multitags;
use crate::parser::ParseFailure;
use crate::rules::{CatId, RuleId};
use crate::sentence::Sentence;
use crate::utils::{Score, Span, log};

pub type CoarseId = u32;
pub type FineId = u32;

/// Items built by a lexical or binary step are `Base`; one round of unary
/// rules is applied to them to build `Unary` items, which are never extended
/// by another unary rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
  Base,
  Unary,
}

/// How a coarse item can be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseBack {
  Lexical { rule: RuleId, word: usize },
  Unary { rule: RuleId, child: CoarseId },
  Binary { rule: RuleId, left: CoarseId, right: CoarseId },
}

#[derive(Debug, Clone)]
pub struct CoarseItem {
  pub cat: CatId,
  pub span: Span,
  pub level: Level,
  pub backs: Vec<CoarseBack>,
  /// Live (unpruned) refinements, in creation order.
  pub fine: Vec<FineId>,
}

/// Which backpointers each fine item keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retain {
  /// Only the best one.
  Best,
  /// The `k` best, in descending score order.
  KBest(usize),
  /// All of them, in descending score order.
  All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineBack {
  Lexical { rule: RuleId, word: usize },
  Unary { rule: RuleId, child: FineId },
  Binary { rule: RuleId, left: FineId, right: FineId },
}

impl FineBack {
  pub fn rule(&self) -> RuleId {
    match self {
      Self::Lexical { rule, .. } | Self::Unary { rule, .. } | Self::Binary { rule, .. } => *rule,
    }
  }

  pub fn children(&self) -> Vec<FineId> {
    match self {
      Self::Lexical { .. } => Vec::new(),
      Self::Unary { child, .. } => vec![*child],
      Self::Binary { left, right, .. } => vec![*left, *right],
    }
  }
}

/// A scored backpointer. `score` is `local` plus the children's best scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FineEdge {
  pub back: FineBack,
  pub local: Score,
  pub score: Score,
}

#[derive(Debug, Clone)]
pub struct FineItem {
  pub coarse: CoarseId,
  pub site: Site,
  /// Best inside score; equal to `edges[0].score`.
  pub score: Score,
  /// Sorted by descending score; ties keep insertion order.
  pub edges: Vec<FineEdge>,
  pub pruned: bool,
}

/// A fine item in the top cell whose category may end a derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Root {
  pub fine: FineId,
  pub rule: RuleId,
  pub local: Score,
  pub score: Score,
}

#[derive(Debug, Clone, Default)]
struct Cell {
  items: Vec<CoarseId>,
  index: HashMap<(CatId, Level), CoarseId>,
}

#[derive(Debug)]
pub struct Chart<'a> {
  grammar: &'a Grammar,
  sentence: &'a Sentence,
  beta: f64,
  cells: Vec<Cell>,
  coarse: Vec<CoarseItem>,
  fine: Vec<FineItem>,
  roots: Vec<Root>,
  retain: Option<Retain>,
}

/// Inserts `edge` keeping `edges` sorted by descending score, earlier edges
/// first among equals.
pub(crate) fn retain_edge(edges: &mut Vec<FineEdge>, edge: FineEdge, retain: Retain) {
  match retain {
    Retain::Best => {
      if edges.is_empty() || edge.score > edges[0].score {
        edges.clear();
        edges.push(edge);
      }
    }
    Retain::KBest(k) => {
      let pos = edges.partition_point(|e| e.score >= edge.score);
      if pos < k {
        edges.insert(pos, edge);
        edges.truncate(k);
      }
    }
    Retain::All => {
      let pos = edges.partition_point(|e| e.score >= edge.score);
      edges.insert(pos, edge);
    }
  }
}

impl<'a> Chart<'a> {
  /// Runs the coarse pass with supertagger beam `beta`.
  ///
  /// Fails with [`ParseFailure::Coarse`] if no start category spans the
  /// sentence, and with [`ParseFailure::Abandoned`] once more than
  /// `max_items` coarse items have been built.
  pub fn coarse(
    grammar: &'a Grammar,
    sentence: &'a Sentence,
    tags: &Multitags,
    beta: f64,
    max_items: usize,
  ) -> std::result::Result<Self, ParseFailure> {
    let n = sentence.len();
    let mut chart = Self {
      grammar,
      sentence,
      beta,
      cells: vec![Cell::default(); n * n],
      coarse: Vec::new(),
      fine: Vec::new(),
      roots: Vec::new(),
      retain: None,
    };
    if n == 0 {
      return Err(ParseFailure::Coarse);
    }

    for word in 0..n {
      let span = Span::new(word, word + 1);
      for tag in tags.within(word, beta) {
        if let Some(rule) = grammar.lexical_rule(tag.cat) {
          chart.insert(span, tag.cat, Level::Base, CoarseBack::Lexical { rule, word }, max_items)?;
        }
      }
      chart.apply_unary(span, max_items)?;
    }

    for len in 2..=n {
      for start in 0..=(n - len) {
        let end = start + len;
        let span = Span::new(start, end);
        for split in (start + 1)..end {
          let lefts = chart.cell(Span::new(start, split)).items.clone();
          let rights = chart.cell(Span::new(split, end)).items.clone();
          for l in lefts.iter() {
            let lcat = chart.coarse[*l as usize].cat;
            for r in rights.iter() {
              let rcat = chart.coarse[*r as usize].cat;
              for rule in grammar.binary_rules(lcat, rcat) {
                let Some(result) = grammar.combine(*rule, lcat, rcat) else {
                  continue;
                };
                let back = CoarseBack::Binary {
                  rule: *rule,
                  left: *l,
                  right: *r,
                };
                chart.insert(span, result, Level::Base, back, max_items)?;
              }
            }
          }
        }
        chart.apply_unary(span, max_items)?;
      }
    }

    trace!(words = n, beta, items = chart.coarse.len(), "coarse chart");
    if chart.spans() {
      Ok(chart)
    } else {
      Err(ParseFailure::Coarse)
    }
  }

  fn cell_index(&self, span: Span) -> usize {
    span.start * self.sentence.len() + (span.end - 1)
  }

  fn cell(&self, span: Span) -> &Cell {
    &self.cells[self.cell_index(span)]
  }

  fn insert(
    &mut self,
    span: Span,
    cat: CatId,
    level: Level,
    back: CoarseBack,
    max_items: usize,
  ) -> std::result::Result<(), ParseFailure> {
    let idx = self.cell_index(span);
    if let Some(id) = self.cells[idx].index.get(&(cat, level)) {
      self.coarse[*id as usize].backs.push(back);
      return Ok(());
    }
    if self.coarse.len() >= max_items {
      debug!(items = self.coarse.len(), "item budget exhausted, abandoning sentence");
      return Err(ParseFailure::Abandoned);
    }
    let id = self.coarse.len() as CoarseId;
    self.coarse.push(CoarseItem {
      cat,
      span,
      level,
      backs: vec![back],
      fine: Vec::new(),
    });
    let cell = &mut self.cells[idx];
    cell.items.push(id);
    cell.index.insert((cat, level), id);
    Ok(())
  }

  fn apply_unary(&mut self, span: Span, max_items: usize) -> std::result::Result<(), ParseFailure> {
    let grammar = self.grammar;
    let bases = self
      .cell(span)
      .items
      .iter()
      .copied()
      .filter(|id| self.coarse[*id as usize].level == Level::Base)
      .collect::<Vec<_>>();
    for child in bases {
      let cat = self.coarse[child as usize].cat;
      for rule in grammar.unary_rules(cat) {
        if let Some(result) = grammar.combine_unary(*rule, cat) {
          let back = CoarseBack::Unary { rule: *rule, child };
          self.insert(span, result, Level::Unary, back, max_items)?;
        }
      }
    }
    Ok(())
  }

  /// Does a start category span the whole sentence?
  pub fn spans(&self) -> bool {
    let n = self.sentence.len();
    n > 0
      && self
        .cell(Span::new(0, n))
        .items
        .iter()
        .any(|id| self.grammar.is_start(self.coarse[*id as usize].cat))
  }

  pub fn grammar(&self) -> &'a Grammar {
    self.grammar
  }

  pub fn sentence(&self) -> &'a Sentence {
    self.sentence
  }

  pub fn context(&self) -> Context<'a> {
    Context::new(self.grammar, self.sentence)
  }

  pub fn len(&self) -> usize {
    self.sentence.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sentence.is_empty()
  }

  /// The supertagger beam this chart was built with.
  pub fn beta(&self) -> f64 {
    self.beta
  }

  /// Retention mode of the last fine pass, if one ran.
  pub fn retain(&self) -> Option<Retain> {
    self.retain
  }

  pub fn coarse_item(&self, id: CoarseId) -> &CoarseItem {
    &self.coarse[id as usize]
  }

  pub fn coarse_items(&self) -> &[CoarseItem] {
    &self.coarse
  }

  /// Coarse items over `span`, in creation order.
  pub fn items(&self, span: Span) -> impl Iterator<Item = &CoarseItem> {
    self.cell(span).items.iter().map(|id| &self.coarse[*id as usize])
  }

  /// Categories present over `span`, sorted and deduplicated across levels.
  pub fn categories(&self, span: Span) -> Vec<CatId> {
    let mut cats = self.items(span).map(|i| i.cat).collect::<Vec<_>>();
    cats.sort_unstable();
    cats.dedup();
    cats
  }

  pub fn fine_item(&self, id: FineId) -> &FineItem {
    &self.fine[id as usize]
  }

  pub fn fine_items(&self) -> &[FineItem] {
    &self.fine
  }

  /// Admissible roots, best first.
  pub fn roots(&self) -> &[Root] {
    &self.roots
  }

  pub fn has_parse(&self) -> bool {
    !self.roots.is_empty()
  }

  /// Runs the fine pass under `model`, replacing any earlier fine pass.
  ///
  /// Afterwards [`Chart::roots`] is empty if no derivation survived, which the
  /// caller reports as a fine failure. An error is returned only if the model
  /// belongs to a different grammar.
  pub fn fine(&mut self, model: &dyn ScoringModel, retain: Retain, beam: Option<f64>) -> Result<()> {
    self.grammar.check(model.grammar_id())?;

    self.fine.clear();
    self.roots.clear();
    for item in self.coarse.iter_mut() {
      item.fine.clear();
    }
    self.retain = Some(retain);

    let n = self.sentence.len();
    let ctx = self.context();
    for len in 1..=n {
      for start in 0..=(n - len) {
        let span = Span::new(start, start + len);
        let first = self.fine.len();
        let items = self.cell(span).items.clone();
        let mut lookup: HashMap<(CoarseId, Refinement), FineId> = HashMap::new();
        for level in [Level::Base, Level::Unary] {
          for cid in items.iter().copied() {
            if self.coarse[cid as usize].level == level {
              self.expand(model, &ctx, cid, retain, &mut lookup);
            }
          }
        }
        if let Some(beam) = beam {
          self.prune(model, &ctx, first, beam);
        }
      }
    }

    self.find_roots(model, &ctx);
    trace!(
      model = model.name(),
      fine = self.fine.len(),
      roots = self.roots.len(),
      "fine chart"
    );
    Ok(())
  }

  fn expand(
    &mut self,
    model: &dyn ScoringModel,
    ctx: &Context<'_>,
    cid: CoarseId,
    retain: Retain,
    lookup: &mut HashMap<(CoarseId, Refinement), FineId>,
  ) {
    let backs = self.coarse[cid as usize].backs.clone();
    let (cat, span) = {
      let item = &self.coarse[cid as usize];
      (item.cat, item.span)
    };

    for back in backs {
      match back {
        CoarseBack::Lexical { rule, word } => {
          let refinement = model.refine_lexical(ctx, cat, word);
          let site = Site::new(cat, span, refinement);
          match model.score_lexical(ctx, rule, &site) {
            Ok(local) => {
              let edge = FineEdge {
                back: FineBack::Lexical { rule, word },
                local,
                score: local,
              };
              self.add_edge(cid, site, edge, retain, lookup);
            }
            Err(e) => trace!(%e, "dropping lexical expansion"),
          }
        }
        CoarseBack::Unary { rule, child } => {
          let children = self.coarse[child as usize].fine.clone();
          for c in children {
            let child_site = self.fine[c as usize].site;
            let child_score = self.fine[c as usize].score;
            let refinement = model.refine_unary(ctx, rule, &child_site);
            let site = Site::new(cat, span, refinement);
            match model.score_unary(ctx, rule, &site, &child_site) {
              Ok(local) => {
                let edge = FineEdge {
                  back: FineBack::Unary { rule, child: c },
                  local,
                  score: log::mul(local, child_score),
                };
                self.add_edge(cid, site, edge, retain, lookup);
              }
              Err(e) => trace!(%e, "dropping unary expansion"),
            }
          }
        }
        CoarseBack::Binary { rule, left, right } => {
          let lefts = self.coarse[left as usize].fine.clone();
          let rights = self.coarse[right as usize].fine.clone();
          for l in lefts.iter().copied() {
            for r in rights.iter().copied() {
              let (lsite, lscore) = (self.fine[l as usize].site, self.fine[l as usize].score);
              let (rsite, rscore) = (self.fine[r as usize].site, self.fine[r as usize].score);
              let refinement = model.refine_binary(ctx, rule, &lsite, &rsite);
              let site = Site::new(cat, span, refinement);
              match model.score_binary(ctx, rule, &site, &lsite, &rsite) {
                Ok(local) => {
                  let edge = FineEdge {
                    back: FineBack::Binary {
                      rule,
                      left: l,
                      right: r,
                    },
                    local,
                    score: log::mul(local, log::mul(lscore, rscore)),
                  };
                  self.add_edge(cid, site, edge, retain, lookup);
                }
                Err(e) => trace!(%e, "dropping binary expansion"),
              }
            }
          }
        }
      }
    }
  }

  fn add_edge(
    &mut self,
    cid: CoarseId,
    site: Site,
    edge: FineEdge,
    retain: Retain,
    lookup: &mut HashMap<(CoarseId, Refinement), FineId>,
  ) {
    match lookup.get(&(cid, site.refinement)) {
      Some(id) => {
        let item = &mut self.fine[*id as usize];
        retain_edge(&mut item.edges, edge, retain);
        item.score = item.edges[0].score;
      }
      None => {
        let id = self.fine.len() as FineId;
        self.fine.push(FineItem {
          coarse: cid,
          site,
          score: edge.score,
          edges: vec![edge],
          pruned: false,
        });
        self.coarse[cid as usize].fine.push(id);
        lookup.insert((cid, site.refinement), id);
      }
    }
  }

  /// Drops fine items of one cell (those from `first` on) whose score plus
  /// figure of merit falls below `beam` times the cell's best.
  fn prune(&mut self, model: &dyn ScoringModel, ctx: &Context<'_>, first: usize, beam: f64) {
    let foms = self.fine[first..]
      .iter()
      .map(|item| log::mul(item.score, model.figure_of_merit(ctx, &item.site)))
      .collect::<Vec<_>>();
    let best = foms.iter().copied().fold(log::ZERO, f64::max);
    if log::is_zero(best) {
      return;
    }
    let threshold = best + beam.ln();
    let mut pruned = 0;
    for (offset, fom) in foms.into_iter().enumerate() {
      if fom < threshold {
        let id = (first + offset) as FineId;
        let item = &mut self.fine[first + offset];
        item.pruned = true;
        let cid = item.coarse as usize;
        self.coarse[cid].fine.retain(|f| *f != id);
        pruned += 1;
      }
    }
    if pruned > 0 {
      trace!(pruned, "fine beam");
    }
  }

  fn find_roots(&mut self, model: &dyn ScoringModel, ctx: &Context<'_>) {
    let n = self.sentence.len();
    let top = self.cell(Span::new(0, n)).items.clone();
    for cid in top {
      let cat = self.coarse[cid as usize].cat;
      let Some(rule) = self.grammar.top_rule(cat) else {
        continue;
      };
      for f in self.coarse[cid as usize].fine.clone() {
        let item = &self.fine[f as usize];
        match model.score_top(ctx, rule, &item.site) {
          Ok(local) => {
            let score = log::mul(local, item.score);
            if log::is_zero(score) {
              continue;
            }
            let root = Root {
              fine: f,
              rule,
              local,
              score,
            };
            let pos = self.roots.partition_point(|r| r.score >= score);
            self.roots.insert(pos, root);
          }
          Err(e) => trace!(%e, "dropping root"),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::deps::{Dependency, dependencies};
  use crate::derivation::viterbi;
  use crate::kbest::k_best;
  use crate::rules::Combinator;
  use crate::sentence::Token;
  use crate::syntree::SynTree;
  use crate::test_utils::*;

  #[test]
  fn test_coarse_the_dog_runs() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    assert!(chart.spans());
    assert_eq!(chart.categories(Span::new(0, 3)), vec![g.cat_id("S").unwrap()]);
    assert_eq!(chart.categories(Span::new(0, 2)), vec![g.cat_id("NP").unwrap()]);
    assert!(chart.categories(Span::new(1, 3)).is_empty());
  }

  #[test]
  fn test_coarse_failure_without_tags() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = Multitags::from_strs(&g, &[&[("NP/N", 1.0)], &[], &[("S\\NP", 1.0)]]).unwrap();
    for beta in crate::config::DEFAULT_BETAS {
      assert_eq!(
        Chart::coarse(&g, &s, &tags, *beta, 1000).err(),
        Some(ParseFailure::Coarse)
      );
    }
  }

  #[test]
  fn test_item_budget() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    assert_eq!(
      Chart::coarse(&g, &s, &tags, 0.1, 2).err(),
      Some(ParseFailure::Abandoned)
    );
  }

  #[test]
  fn test_beta_monotonicity() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let mut previous: Option<Chart> = None;
    for beta in crate::config::DEFAULT_BETAS {
      let Ok(chart) = Chart::coarse(&g, &s, &tags, *beta, 10_000) else {
        assert!(previous.is_none(), "a looser beam lost the parse");
        continue;
      };
      if let Some(prev) = previous.as_ref() {
        for start in 0..s.len() {
          for end in (start + 1)..=s.len() {
            let span = Span::new(start, end);
            let loose = chart.categories(span);
            assert!(prev.categories(span).iter().all(|c| loose.contains(c)));
          }
        }
      }
      previous = Some(chart);
    }
    assert!(previous.is_some());
  }

  #[test]
  fn test_fine_score_decomposition() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::All, None).unwrap();

    for item in chart.fine_items() {
      for edge in item.edges.iter() {
        let children = edge
          .back
          .children()
          .iter()
          .map(|c| chart.fine_item(*c).score)
          .sum::<f64>();
        assert!((edge.score - (edge.local + children)).abs() < 1e-9);
      }
      assert_eq!(item.score, item.edges[0].score);
    }
    let fine_ids_ordered = chart.fine_items().iter().enumerate().all(|(id, item)| {
      item
        .edges
        .iter()
        .all(|e| e.back.children().iter().all(|c| (*c as usize) < id))
    });
    assert!(fine_ids_ordered);
    assert_eq!(chart.roots().len(), 1);
  }

  #[test]
  fn test_zero_propagates() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let mut model = FixedModel::new(&g);
    // "dog" as N is impossible
    model.zero_lexical = Some(g.cat_id("N").unwrap());
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    chart.fine(&model, Retain::Best, None).unwrap();

    let np = g.cat_id("NP").unwrap();
    let s_cat = g.cat_id("S").unwrap();
    for item in chart.fine_items() {
      if item.site.cat == np || item.site.cat == s_cat {
        assert!(log::is_zero(item.score));
      }
    }
    assert!(!chart.has_parse());
  }

  #[test]
  fn test_fine_rejects_foreign_model() {
    let g = toy_grammar();
    let other = toy_grammar();
    let s = the_dog_runs();
    let tags = the_dog_runs_tags(&g);
    let model = FixedModel::new(&other);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    assert!(matches!(
      chart.fine(&model, Retain::Best, None),
      Err(crate::errors::Error::GrammarMismatch { .. })
    ));
  }

  #[test]
  fn test_retention_modes() {
    let edge = |score: f64, word: usize| FineEdge {
      back: FineBack::Lexical { rule: 0, word },
      local: score,
      score,
    };
    let mut best = Vec::new();
    retain_edge(&mut best, edge(-2.0, 0), Retain::Best);
    retain_edge(&mut best, edge(-1.0, 1), Retain::Best);
    retain_edge(&mut best, edge(-1.0, 2), Retain::Best);
    assert_eq!(best.len(), 1);
    assert_eq!(best[0].back, FineBack::Lexical { rule: 0, word: 1 });

    let mut k = Vec::new();
    for (i, s) in [-3.0, -1.0, -2.0, -1.0, -0.5].into_iter().enumerate() {
      retain_edge(&mut k, edge(s, i), Retain::KBest(3));
    }
    let words = k
      .iter()
      .map(|e| match e.back {
        FineBack::Lexical { word, .. } => word,
        _ => unreachable!(),
      })
      .collect::<Vec<_>>();
    assert_eq!(words, vec![4, 1, 3]);
  }

  #[test]
  fn test_fom_beam_prunes() {
    let g = ambiguous_grammar();
    let s = ambiguous_sentence();
    let tags = ambiguous_tags(&g);
    let model = FixedModel::new(&g);
    let mut chart = Chart::coarse(&g, &s, &tags, 0.005, 10_000).unwrap();
    let intransitive = g.cat_id("S\\NP").unwrap();
    let postmod = g.cat_id("NP\\NP").unwrap();
    let live = |chart: &Chart<'_>, span: Span, cat: CatId| {
      chart
        .items(span)
        .filter(|i| i.cat == cat)
        .map(|i| i.fine.len())
        .sum::<usize>()
    };

    chart.fine(&model, Retain::Best, None).unwrap();
    let unpruned = chart.fine_items().iter().filter(|i| !i.pruned).count();
    assert_eq!(live(&chart, Span::new(1, 2), intransitive), 1);
    assert_eq!(live(&chart, Span::new(3, 4), postmod), 1);

    // lexical scores one tenth apart: the weaker category of each word falls out
    chart.fine(&model, Retain::Best, Some(0.95)).unwrap();
    let kept = chart.fine_items().iter().filter(|i| !i.pruned).count();
    assert!(kept < unpruned);
    assert_eq!(live(&chart, Span::new(1, 2), intransitive), 0);
    assert_eq!(live(&chart, Span::new(3, 4), postmod), 0);
    assert!(chart.has_parse());
    assert!(chart.fine_items().iter().all(|i| i.pruned || !log::is_zero(i.score)));
  }

  #[test]
  fn test_type_change_in_fine_pass() {
    let mut b = Grammar::builder();
    b.lexical("N").unwrap();
    b.lexical("S\\NP").unwrap();
    b.start("S").unwrap();
    b.type_change("N", "NP").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp]);
    let g = b.build().unwrap();

    let s = Sentence::new(vec![Token::new("dogs", "NNS"), Token::new("run", "VBP")]);
    let tags = Multitags::from_strs(&g, &[&[("N", 1.0)], &[("S\\NP", 1.0)]]).unwrap();
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    let (n, np) = (g.cat_id("N").unwrap(), g.cat_id("NP").unwrap());
    let mut word = vec![n, np];
    word.sort_unstable();
    assert_eq!(chart.categories(Span::new(0, 1)), word);
    let changed = chart.items(Span::new(0, 1)).find(|i| i.cat == np).unwrap();
    assert_eq!(changed.level, Level::Unary);

    chart.fine(&FixedModel::new(&g), Retain::Best, None).unwrap();
    let tree = viterbi(&chart).unwrap().tree;
    let (_, children) = tree.get_branch().unwrap();
    let SynTree::Branch(subject, below) = &children[0] else {
      panic!("subject should be a unary node");
    };
    assert_eq!(below.len(), 1);
    assert_eq!(subject.value.cat, np);
    assert_eq!(g.rule(subject.value.rule).unwrap().combinator, Combinator::TypeChange);

    let deps = dependencies(&g, &tree);
    assert_eq!(
      deps.iter().copied().collect::<Vec<_>>(),
      vec![Dependency {
        target: 1,
        source: 0,
        cat: g.cat_id("S\\NP").unwrap(),
        slot: 1,
      }]
    );
  }

  #[test]
  fn test_punctuation_attaches_either_side() {
    let mut b = Grammar::builder();
    for c in ["NP", "S\\NP", "."] {
      b.lexical(c).unwrap();
    }
    b.start("S").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp, Combinator::RightPunct]);
    let g = b.build().unwrap();

    let s = Sentence::new(vec![
      Token::new("dogs", "NNS"),
      Token::new("run", "VBP"),
      Token::new(".", "."),
    ]);
    let tags = Multitags::from_strs(&g, &[&[("NP", 1.0)], &[("S\\NP", 1.0)], &[(".", 1.0)]]).unwrap();
    let mut chart = Chart::coarse(&g, &s, &tags, 0.1, 1000).unwrap();
    // the full stop is absorbed by the verb phrase or by the sentence
    assert_eq!(chart.categories(Span::new(1, 3)), vec![g.cat_id("S\\NP").unwrap()]);
    chart.fine(&FixedModel::new(&g), Retain::All, None).unwrap();

    let parses = k_best(&chart, 10);
    assert_eq!(parses.len(), 2);
    let subject = Dependency {
      target: 1,
      source: 0,
      cat: g.cat_id("S\\NP").unwrap(),
      slot: 1,
    };
    for parse in parses.iter() {
      assert_eq!(parse.tree.get_branch().unwrap().0.value.cat, g.cat_id("S").unwrap());
      let deps = dependencies(&g, &parse.tree);
      assert_eq!(deps.iter().copied().collect::<Vec<_>>(), vec![subject]);
    }
  }
}
