mod build_grammar;
mod parse;
mod train;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ccgbender::{AutoNode, Grammar, Multitags, Sentence, read_auto, read_multitags};

pub type Err = Box<dyn std::error::Error + 'static>;

#[derive(Parser, Debug)]
#[clap(name = "ccgbender", version, about = "Coarse-to-fine CCG chart parser")]
struct Cli {
  #[clap(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Builds a grammar from gold AUTO derivations.
  BuildGrammar(build_grammar::Args),

  /// Parses multitagged sentences and prints lexical categories and dependencies.
  Parse(parse::Args),

  /// Trains perceptron weights on gold AUTO derivations.
  Train(train::Args),
}

pub(crate) fn read_auto_file(path: &Path) -> Result<Vec<AutoNode>, Err> {
  Ok(read_auto(BufReader::new(File::open(path)?))?)
}

pub(crate) fn read_multitag_file(path: &Path, grammar: &Grammar) -> Result<Vec<(Sentence, Multitags)>, Err> {
  Ok(read_multitags(BufReader::new(File::open(path)?), grammar)?)
}

pub(crate) fn parse_betas(s: &str) -> Result<Vec<f64>, Err> {
  s.split(',')
    .map(|b| {
      b.trim()
        .parse::<f64>()
        .map_err(|e| format!("bad beta '{}': {}", b, e).into())
    })
    .collect()
}

fn main() -> Result<(), Err> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  match cli.command {
    Command::BuildGrammar(args) => build_grammar::run(args),
    Command::Parse(args) => parse::run(args),
    Command::Train(args) => train::run(args),
  }
}
