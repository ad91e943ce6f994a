use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use ccgbender::config::DEFAULT_BETAS;
use ccgbender::{
  BaselineModel, Derivation, Grammar, HeadWordModel, LexCatModel, ParseFailure, ParseStats, ParserConfig,
  PerceptronModel, Retain, ScoringModel, Sentence, dependencies, lexical_categories,
};

use crate::{Err, parse_betas, read_auto_file, read_multitag_file};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
  Baseline,
  Lexcat,
  Headword,
  Perceptron,
}

#[derive(Parser, Debug)]
pub struct Args {
  /// Grammar directory written by `build-grammar`.
  #[clap(short = 'g', long)]
  grammar: PathBuf,

  /// Multitagged sentences to parse.
  #[clap(short = 'i', long)]
  input: PathBuf,

  /// Output file; standard output if absent.
  #[clap(short = 'o', long)]
  output: Option<PathBuf>,

  #[clap(short = 'm', long, value_enum, default_value = "headword")]
  model: ModelKind,

  /// Gold AUTO derivations to estimate a generative model from.
  #[clap(long)]
  train_auto: Option<PathBuf>,

  /// Condition generative models on head distance.
  #[clap(long)]
  distance: bool,

  /// Weight file of a trained perceptron model.
  #[clap(short = 'w', long)]
  weights: Option<PathBuf>,

  /// Gold AUTO derivations for the input, for evaluation.
  #[clap(long)]
  gold: Option<PathBuf>,

  /// Comma-separated supertagger beams, loosest last.
  #[clap(long)]
  betas: Option<String>,

  #[clap(long, default_value = "250")]
  max_len: usize,

  /// Fine-pass figure-of-merit beam, as a probability ratio.
  #[clap(long)]
  fine_beam: Option<f64>,

  #[clap(long, default_value = "1")]
  num_threads: usize,
}

fn estimate(args: &Args, grammar: &Grammar) -> Result<Box<dyn ScoringModel>, Err> {
  if args.model == ModelKind::Perceptron {
    let path = args
      .weights
      .as_ref()
      .ok_or("the perceptron model needs --weights")?;
    return Ok(Box::new(PerceptronModel::load(grammar, path)?));
  }

  let path = args
    .train_auto
    .as_ref()
    .ok_or("generative models need --train-auto")?;
  let trees = read_auto_file(path)?;
  let mut corpus: Vec<(Sentence, Derivation)> = Vec::with_capacity(trees.len());
  for tree in trees.iter() {
    match tree.resolve(grammar) {
      Ok(d) => corpus.push((tree.sentence(), d)),
      Err(e) => warn!(%e, "skipping training derivation"),
    }
  }
  let pairs = corpus.iter().map(|(s, d)| (s, d));
  let model: Box<dyn ScoringModel> = match args.model {
    ModelKind::Baseline => Box::new(BaselineModel::estimate(grammar, args.distance, pairs)?),
    ModelKind::Lexcat => Box::new(LexCatModel::estimate(grammar, args.distance, pairs)?),
    _ => Box::new(HeadWordModel::estimate(grammar, args.distance, pairs)?),
  };
  info!(model = model.name(), sentences = corpus.len(), "model estimated");
  Ok(model)
}

pub fn run(args: Args) -> Result<(), Err> {
  let grammar = Grammar::load(&args.grammar)?;
  let model = estimate(&args, &grammar)?;
  let input = read_multitag_file(&args.input, &grammar)?;
  let gold = match &args.gold {
    Some(path) => Some(read_auto_file(path)?),
    None => None,
  };

  let betas = match &args.betas {
    Some(s) => parse_betas(s)?,
    None => DEFAULT_BETAS.to_vec(),
  };
  let config = ParserConfig::new()
    .betas(&betas)
    .max_sentence_len(args.max_len)
    .fine_beam(args.fine_beam)
    .num_threads(args.num_threads)
    .retain(Retain::Best);
  let parser = ccgbender::Parser::new(&grammar, model.as_ref(), config)?;
  let results = parser.parse_corpus(&input)?;

  let mut out: Box<dyn Write> = match &args.output {
    Some(path) => Box::new(BufWriter::new(File::create(path)?)),
    None => Box::new(BufWriter::new(io::stdout().lock())),
  };
  let mut stats = ParseStats::new();
  for (i, ((sentence, _), result)) in input.iter().zip(results.iter()).enumerate() {
    let tree = result.as_ref().map(|p| &p.tree).map_err(|e| *e);
    match gold.as_ref().and_then(|g| g.get(i)).map(|g| g.resolve(&grammar)) {
      Some(Ok(gold)) => stats.record(&grammar, sentence.len(), tree, Some(&gold)),
      Some(Err(e)) => {
        warn!(sentence = i, %e, "gold derivation not reproducible");
        stats.record_unparseable();
      }
      None => stats.record(&grammar, sentence.len(), tree, None),
    }

    let cats = lexical_categories(tree.ok(), sentence.len())
      .iter()
      .map(|c| c.display(&grammar))
      .collect::<Vec<_>>();
    writeln!(out, "{}", cats.join(" "))?;
    match tree {
      Ok(tree) => write!(out, "{}", dependencies(&grammar, tree).render(&grammar, sentence))?,
      Err(ParseFailure::Abandoned) => writeln!(out, "# abandoned")?,
      Err(failure) => writeln!(out, "# {}", failure)?,
    }
    writeln!(out)?;
  }
  out.flush()?;

  stats.log();
  info!("\n{}", stats);
  Ok(())
}
