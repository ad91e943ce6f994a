use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use ccgbender::Grammar;

use crate::{Err, read_auto_file};

#[derive(Parser, Debug)]
pub struct Args {
  /// Gold derivations in CCGbank AUTO format.
  #[clap(short = 'a', long)]
  auto: PathBuf,

  /// Directory the grammar is written to.
  #[clap(short = 'o', long)]
  out: PathBuf,

  /// Only keep rules seen in the derivations, instead of every combinator
  /// instance over the category set.
  #[clap(long)]
  observed_only: bool,

  /// Drop rules seen fewer times than this.
  #[clap(long, default_value = "0")]
  min_rule_count: u32,

  /// Type-raising rule as `X:T`, e.g. `NP:S`. May be repeated.
  #[clap(long = "type-raise")]
  type_raise: Vec<String>,

  /// Type-changing rule as `FROM:TO`, e.g. `N:NP`. May be repeated.
  #[clap(long = "type-change")]
  type_change: Vec<String>,
}

fn pair(s: &str) -> Result<(&str, &str), Err> {
  s.split_once(':')
    .ok_or_else(|| format!("expected FROM:TO, got '{}'", s).into())
}

pub fn run(args: Args) -> Result<(), Err> {
  let trees = read_auto_file(&args.auto)?;
  let mut builder = Grammar::builder();
  builder
    .enumerate(!args.observed_only)
    .min_rule_count(args.min_rule_count);
  for r in args.type_raise.iter() {
    let (x, t) = pair(r)?;
    builder.type_raise(x, t)?;
  }
  for r in args.type_change.iter() {
    let (from, to) = pair(r)?;
    builder.type_change(from, to)?;
  }

  let mut skipped = 0;
  for (i, tree) in trees.iter().enumerate() {
    if let Err(e) = builder.observe(tree) {
      warn!(derivation = i, %e, "skipping derivation");
      skipped += 1;
    }
  }

  let grammar = builder.build()?;
  grammar.save(&args.out)?;
  info!(
    derivations = trees.len(),
    skipped,
    categories = grammar.num_categories(),
    rules = grammar.rules().len(),
    out = %args.out.display(),
    "grammar written"
  );
  Ok(())
}
