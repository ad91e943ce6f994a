//! Averaged structured perceptron over cached packed forests.
//!
//! Training runs in two phases. Extraction parses every sentence once with
//! all backpointers kept, packs the chart into a [`PackedForest`] and writes
//! it to a [`ForestStore`] in the work directory; rare features are then
//! pruned and the store rewritten. Each epoch after that only rescores the
//! stored forests, so the parser itself never runs again.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use tracing::{debug, info, info_span, warn};

use crate::auto::AutoNode;
use crate::chart::Retain;
use crate::config::{ParserConfig, TrainerConfig};
use crate::derivation::Derivation;
use crate::errors::{Error, Result};
use crate::features::{FeatureTable, averaged_path, write_weights};
use crate::forest::PackedForest;
use crate::grammar::Grammar;
use crate::model::{PerceptronModel, ScoringModel, perceptron};
use crate::multitag::{Multitags, Tag};
use crate::parser::coarse_chart;
use crate::sentence::Sentence;
use crate::store::{ForestStore, ForestWriter};

/// Where a training sentence is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
  Unprocessed,
  Multitagged,
  CoarseParsed,
  FeaturesExtracted,
  ForestBuilt,
  Scored,
  WeightsUpdated,
  /// The sentence cannot be trained on. Kept for reporting.
  Unparseable,
}

impl Stage {
  pub fn can_advance(self, to: Stage) -> bool {
    use Stage::*;
    match (self, to) {
      (Unprocessed, Multitagged)
      | (Multitagged, CoarseParsed)
      | (CoarseParsed, FeaturesExtracted)
      | (FeaturesExtracted, ForestBuilt)
      | (ForestBuilt, Scored)
      | (Scored, WeightsUpdated)
      | (WeightsUpdated, Scored) => true,
      (Unprocessed | Multitagged | CoarseParsed | FeaturesExtracted, Unparseable) => true,
      _ => false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
  pub sentence: usize,
  pub stage: Stage,
}

impl Record {
  pub fn new(sentence: usize) -> Self {
    Self {
      sentence,
      stage: Stage::Unprocessed,
    }
  }

  pub fn advance(&mut self, to: Stage) -> Result<()> {
    if !self.stage.can_advance(to) {
      return Err(Error::InvalidTransition {
        sentence: self.sentence,
        from: self.stage,
        to,
      });
    }
    self.stage = to;
    Ok(())
  }
}

/// One sentence of training data.
#[derive(Debug, Clone)]
pub struct TrainingExample {
  pub sentence: Sentence,
  /// Supertagger candidates; may be empty.
  pub tags: Multitags,
  /// `None` if the grammar cannot reproduce the gold derivation.
  pub gold: Option<Derivation>,
}

impl TrainingExample {
  pub fn from_auto(grammar: &Grammar, tree: &AutoNode, tags: Option<Multitags>) -> Self {
    let gold = match tree.resolve(grammar) {
      Ok(d) => Some(d),
      Err(e) => {
        debug!(%e, "gold derivation not reproducible");
        None
      }
    };
    Self {
      sentence: tree.sentence(),
      tags: tags.unwrap_or_default(),
      gold,
    }
  }
}

/// The tagger's candidates plus every gold lexical category, each gold
/// category scored like the word's best candidate so that no β excludes it.
fn with_gold_tags(tags: &Multitags, gold: &Derivation) -> Multitags {
  let extra = gold
    .leaves()
    .iter()
    .enumerate()
    .map(|(i, leaf)| {
      vec![Tag {
        cat: leaf.value.cat,
        score: tags.best(i).map_or(1.0, |t| t.score),
      }]
    })
    .collect();
  let mut merged = tags.clone();
  merged.merge(&Multitags::new(extra));
  merged
}

/// Running sum for weight averaging.
///
/// `step` starts at 1 and is ticked once per training example. An update of
/// `Δ` to a weight adds `step · Δ` to its total, and the average of all
/// weight vectors seen so far is `w - total / step`.
#[derive(Debug, Clone, PartialEq)]
pub struct Averager {
  totals: Vec<f64>,
  step: f64,
}

impl Averager {
  pub fn new(n: usize) -> Self {
    Self {
      totals: vec![0.0; n],
      step: 1.0,
    }
  }

  pub fn step(&self) -> f64 {
    self.step
  }

  pub fn tick(&mut self) {
    self.step += 1.0;
  }

  pub fn averaged(&self, weights: &[f64]) -> Vec<f64> {
    weights
      .iter()
      .zip(self.totals.iter())
      .map(|(w, u)| w - u / self.step)
      .collect()
  }
}

/// Perceptron update: `+rate` per gold occurrence of a feature, `-rate` per
/// predicted occurrence. Both count lists must be sorted by feature.
pub fn update(
  weights: &mut [f64],
  averager: &mut Averager,
  gold: &[(u32, u32)],
  predicted: &[(u32, u32)],
  rate: f64,
) {
  let step = averager.step;
  let mut apply = |f: u32, delta: f64| {
    let f = f as usize;
    if f < weights.len() {
      weights[f] += delta;
      averager.totals[f] += step * delta;
    }
  };
  for (f, n) in gold.iter() {
    apply(*f, rate * *n as f64);
  }
  for (f, n) in predicted.iter() {
    apply(*f, -rate * *n as f64);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStats {
  pub epoch: usize,
  pub correct: usize,
  pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
  pub records: Vec<Record>,
  /// Final weights before averaging.
  pub weights: Vec<f64>,
  pub forests: usize,
  pub features: usize,
  pub epochs: Vec<EpochStats>,
}

impl TrainingReport {
  pub fn unparseable(&self) -> usize {
    self
      .records
      .iter()
      .filter(|r| r.stage == Stage::Unparseable)
      .count()
  }
}

struct Checkpoint {
  epoch: usize,
  weights: Vec<f64>,
  averaged: Vec<f64>,
}

pub fn checkpoint_path(dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
  dir.as_ref().join(format!("model.{}", epoch))
}

fn write_checkpoints(dir: &Path, grammar: &Grammar, table: &FeatureTable, rx: Receiver<Checkpoint>) -> Result<()> {
  for cp in rx {
    let path = checkpoint_path(dir, cp.epoch);
    write_weights(&path, perceptron::NAME, grammar, table, Some(cp.weights.as_slice()))?;
    write_weights(averaged_path(&path), perceptron::NAME, grammar, table, Some(cp.averaged.as_slice()))?;
    debug!(path = %path.display(), "checkpoint written");
  }
  Ok(())
}

pub struct Trainer<'a> {
  grammar: &'a Grammar,
  parser: ParserConfig,
  config: TrainerConfig,
}

impl<'a> Trainer<'a> {
  pub fn new(grammar: &'a Grammar, parser: ParserConfig, config: TrainerConfig) -> Result<Self> {
    parser.validate()?;
    config.validate()?;
    Ok(Self {
      grammar,
      parser,
      config,
    })
  }

  fn store_path(&self) -> PathBuf {
    self.config.work_dir.join("forests")
  }

  /// Trains `model` on `corpus`. Afterwards the model holds the averaged
  /// weights. A model that already has weights continues from them, with a
  /// fresh average.
  pub fn train(&self, model: &mut PerceptronModel, corpus: &[TrainingExample]) -> Result<TrainingReport> {
    self.grammar.check(model.grammar_id())?;
    fs::create_dir_all(&self.config.work_dir)?;
    if let Some(dir) = &self.config.checkpoint_dir {
      fs::create_dir_all(dir)?;
    }

    let mut records = (0..corpus.len()).map(Record::new).collect::<Vec<_>>();
    let mut weights = model.weights().to_vec();
    model.table_mut().thaw();
    let forests = self.extract(model, corpus, &mut records)?;

    weights.resize(model.table().len(), 0.0);
    if self.config.feature_cutoff > 1 {
      let remap = model.table_mut().prune(self.config.feature_cutoff);
      let mut kept = vec![0.0; model.table().len()];
      for (old, new) in remap.iter().enumerate() {
        if let Some(new) = new {
          kept[*new as usize] = weights[old];
        }
      }
      weights = kept;
      self.rewrite_store(&remap)?;
      info!(
        features = model.table().len(),
        cutoff = self.config.feature_cutoff,
        "pruned rare features"
      );
    }
    model.table_mut().freeze();

    let mut averager = Averager::new(weights.len());
    let epochs = self.epochs(model.table(), &mut weights, &mut averager, &mut records)?;
    model.set_weights(averager.averaged(&weights))?;

    Ok(TrainingReport {
      records,
      weights,
      forests,
      features: model.table().len(),
      epochs,
    })
  }

  /// Builds and stores a forest for every trainable sentence.
  fn extract(
    &self,
    model: &mut PerceptronModel,
    corpus: &[TrainingExample],
    records: &mut [Record],
  ) -> Result<usize> {
    let mut writer = ForestWriter::create(self.store_path(), self.config.compression)?;
    for (i, example) in corpus.iter().enumerate() {
      let record = &mut records[i];
      let Some(gold) = &example.gold else {
        record.advance(Stage::Unparseable)?;
        continue;
      };
      let tags = with_gold_tags(&example.tags, gold);
      record.advance(Stage::Multitagged)?;

      let mut chart = match coarse_chart(self.grammar, &example.sentence, &tags, &self.parser) {
        Ok(chart) => chart,
        Err(failure) => {
          warn!(sentence = i, %failure, "skipping training sentence");
          record.advance(Stage::Unparseable)?;
          continue;
        }
      };
      record.advance(Stage::CoarseParsed)?;

      chart.fine(&*model, Retain::All, None)?;
      let forest = match PackedForest::build(i as u32, &chart, model, gold) {
        Ok(Some(forest)) => forest,
        Ok(None) => {
          warn!(sentence = i, "gold derivation missing from chart");
          record.advance(Stage::Unparseable)?;
          continue;
        }
        Err(e) => {
          warn!(sentence = i, %e, "skipping training sentence");
          record.advance(Stage::Unparseable)?;
          continue;
        }
      };
      record.advance(Stage::FeaturesExtracted)?;
      writer.write(&forest)?;
      record.advance(Stage::ForestBuilt)?;
    }
    let written = writer.finish()?;
    info!(
      forests = written,
      skipped = corpus.len() - written,
      features = model.table().len(),
      "forests extracted"
    );
    Ok(written)
  }

  fn rewrite_store(&self, remap: &[Option<u32>]) -> Result<()> {
    let path = self.store_path();
    let pruned = self.config.work_dir.join("forests.pruned");
    let mut store = ForestStore::open(&path)?;
    let mut writer = ForestWriter::create(&pruned, self.config.compression)?;
    while let Some(mut forest) = store.next()? {
      forest.remap(remap);
      writer.write(&forest)?;
    }
    writer.finish()?;
    drop(store);
    fs::rename(&pruned, &path)?;
    Ok(())
  }

  fn epochs(
    &self,
    table: &FeatureTable,
    weights: &mut [f64],
    averager: &mut Averager,
    records: &mut [Record],
  ) -> Result<Vec<EpochStats>> {
    let grammar = self.grammar;
    let rate = self.config.learning_rate;
    let mut store = ForestStore::open(self.store_path())?;

    thread::scope(|scope| {
      let (tx, rx) = mpsc::channel();
      let writer = self
        .config
        .checkpoint_dir
        .as_deref()
        .map(|dir| scope.spawn(move || write_checkpoints(dir, grammar, table, rx)));
      let tx = writer.is_some().then_some(tx);

      let mut stats = Vec::with_capacity(self.config.iterations);
      for epoch in 1..=self.config.iterations {
        let _span = info_span!("epoch", epoch).entered();
        store.reset()?;
        let mut correct = 0;
        let mut total = 0;
        while let Some(forest) = store.next()? {
          let record = records
            .get_mut(forest.sentence as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("stored forest for sentence {}", forest.sentence)))?;
          let Some(prediction) = forest.best(weights) else {
            continue;
          };
          record.advance(Stage::Scored)?;
          total += 1;
          if prediction.correct {
            correct += 1;
          } else {
            update(weights, averager, &forest.gold, &prediction.features, rate);
          }
          record.advance(Stage::WeightsUpdated)?;
          averager.tick();
        }
        info!(correct, total, "epoch finished");
        stats.push(EpochStats { epoch, correct, total });

        if let Some(tx) = &tx {
          let cp = Checkpoint {
            epoch,
            weights: weights.to_vec(),
            averaged: averager.averaged(weights),
          };
          if tx.send(cp).is_err() {
            warn!("checkpoint writer stopped early");
          }
        }
      }

      drop(tx);
      if let Some(writer) = writer {
        writer
          .join()
          .map_err(|_| Error::ThreadPanic("checkpoint writer".to_string()))??;
      }
      Ok(stats)
    })
  }
}
