use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use ccgbender::config::DEFAULT_BETAS;
use ccgbender::features::{averaged_path, write_weights};
use ccgbender::model::perceptron;
use ccgbender::{
  Compression, Grammar, Multitags, ParserConfig, PerceptronModel, Sentence, Trainer, TrainerConfig,
  TrainingExample,
};

use crate::{Err, parse_betas, read_auto_file, read_multitag_file};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Codec {
  None,
  Zstd,
  Xz,
}

impl From<Codec> for Compression {
  fn from(codec: Codec) -> Self {
    match codec {
      Codec::None => Compression::None,
      Codec::Zstd => Compression::Zstd,
      Codec::Xz => Compression::Xz,
    }
  }
}

#[derive(Parser, Debug)]
pub struct Args {
  /// Grammar directory written by `build-grammar`.
  #[clap(short = 'g', long)]
  grammar: PathBuf,

  /// Gold training derivations in AUTO format.
  #[clap(short = 'a', long)]
  auto: PathBuf,

  /// Supertagger output for the same sentences. Gold categories are always
  /// added to the candidates.
  #[clap(short = 't', long)]
  multitags: Option<PathBuf>,

  /// Weight file to write; averaged weights go to `<out>.averaged`.
  #[clap(short = 'o', long)]
  out: PathBuf,

  /// Continue from an existing weight file.
  #[clap(long)]
  init: Option<PathBuf>,

  #[clap(short = 'n', long, default_value = "10")]
  iterations: usize,

  #[clap(long, default_value = "1.0")]
  learning_rate: f64,

  /// Drop features seen fewer times than this.
  #[clap(long, default_value = "1")]
  feature_cutoff: u32,

  /// Where packed forests are cached.
  #[clap(long, default_value = "forests")]
  work_dir: PathBuf,

  /// Write weights here after every epoch.
  #[clap(long)]
  checkpoint_dir: Option<PathBuf>,

  /// Forest compression.
  #[clap(long, value_enum, default_value = "zstd")]
  compression: Codec,

  /// Comma-separated supertagger beams, loosest last.
  #[clap(long)]
  betas: Option<String>,

  #[clap(long, default_value = "250")]
  max_len: usize,
}

pub fn run(args: Args) -> Result<(), Err> {
  let grammar = Grammar::load(&args.grammar)?;
  let trees = read_auto_file(&args.auto)?;
  let mut tags: Vec<Option<(Sentence, Multitags)>> = match &args.multitags {
    Some(path) => read_multitag_file(path, &grammar)?.into_iter().map(Some).collect(),
    None => Vec::new(),
  };
  if !tags.is_empty() && tags.len() != trees.len() {
    warn!(
      derivations = trees.len(),
      tagged = tags.len(),
      "multitag file does not line up with the derivations, ignoring it"
    );
    tags.clear();
  }
  tags.resize(trees.len(), None);

  let corpus = trees
    .iter()
    .zip(tags)
    .map(|(tree, tagged)| {
      let tagged = tagged.and_then(|(sentence, t)| (sentence.len() == tree.leaves().len()).then_some(t));
      TrainingExample::from_auto(&grammar, tree, tagged)
    })
    .collect::<Vec<_>>();

  let mut model = match &args.init {
    Some(path) => PerceptronModel::load(&grammar, path)?,
    None => PerceptronModel::new(&grammar),
  };
  let betas = match &args.betas {
    Some(s) => parse_betas(s)?,
    None => DEFAULT_BETAS.to_vec(),
  };
  let parser = ParserConfig::new()
    .betas(&betas)
    .max_sentence_len(args.max_len);
  let config = TrainerConfig::new(&args.work_dir)
    .iterations(args.iterations)
    .learning_rate(args.learning_rate)
    .feature_cutoff(args.feature_cutoff)
    .compression(args.compression.into())
    .checkpoint_dir(args.checkpoint_dir.clone());
  let report = Trainer::new(&grammar, parser, config)?.train(&mut model, &corpus)?;

  // the model now holds averaged weights; the report keeps the last raw ones
  model.save(&grammar, averaged_path(&args.out))?;
  write_weights(
    &args.out,
    perceptron::NAME,
    &grammar,
    model.table(),
    Some(report.weights.as_slice()),
  )?;
  info!(
    forests = report.forests,
    unparseable = report.unparseable(),
    features = report.features,
    out = %args.out.display(),
    "training finished"
  );
  Ok(())
}
