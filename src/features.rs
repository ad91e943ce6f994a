//! Perceptron features: structured keys, the dense feature table, and the
//! text weight-file format.
//!
//! A weight file starts with the model name, then the number of weights (or
//! `-1` for a model that was never trained), then one line per feature:
//!
//! ```text
//! perceptron
//! 3
//! 0	0.5	lexcat N
//! 1	-1	bin fa NP NP/N N
//! 2	2	dist ba S NP S\NP 0
//! ```
//!
//! Descriptions name rules by combinator, result and children rather than by
//! rule id, so a file stays readable and can be checked against the grammar it
//! is loaded with.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::model::{Context, Expansion, distance_bin};
use crate::rules::{CatId, Combinator, Production, Rule, RuleId, Side};
use crate::utils::{SymbolSource, Symbols};

/// One feature. Word and tag payloads are symbols of the owning [`FeatureTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureKey {
  LexCat(CatId),
  LexWord(CatId, u32),
  LexPos(CatId, u32),
  Bin(RuleId),
  /// Rule plus the head word of the result.
  BinWord(RuleId, u32),
  BinPos(RuleId, u32),
  Un(RuleId),
  UnWord(RuleId, u32),
  /// Rule plus head word and the sibling's head word.
  DepWord(RuleId, u32, u32),
  DepPos(RuleId, u32, u32),
  /// Rule plus the distance bin between the two heads.
  Dist(RuleId, u32),
  Root(CatId),
  RootWord(CatId, u32),
}

/// Dense index over feature keys.
///
/// Indices are handed out in registration order and never change until
/// [`FeatureTable::prune`] compacts the table.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
  keys: Vec<FeatureKey>,
  index: HashMap<FeatureKey, u32>,
  counts: Vec<u32>,
  symbols: Symbols,
  frozen: bool,
}

impl FeatureTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.keys.len()
  }

  pub fn is_empty(&self) -> bool {
    self.keys.is_empty()
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen
  }

  /// Stops registration; later `register` calls only look keys up.
  pub fn freeze(&mut self) {
    self.frozen = true;
  }

  pub fn thaw(&mut self) {
    self.frozen = false;
  }

  pub fn symbols(&self) -> &Symbols {
    &self.symbols
  }

  pub(crate) fn symbols_mut(&mut self) -> &mut Symbols {
    &mut self.symbols
  }

  pub fn key(&self, idx: u32) -> Option<FeatureKey> {
    self.keys.get(idx as usize).copied()
  }

  pub fn get(&self, key: &FeatureKey) -> Option<u32> {
    self.index.get(key).copied()
  }

  pub fn count(&self, idx: u32) -> u32 {
    self.counts.get(idx as usize).copied().unwrap_or(0)
  }

  /// Index of `key`, adding it if the table is not frozen. Every call counts
  /// one occurrence.
  pub fn register(&mut self, key: FeatureKey) -> Option<u32> {
    let idx = match self.index.get(&key) {
      Some(idx) => *idx,
      None if self.frozen => return None,
      None => self.insert(key),
    };
    self.counts[idx as usize] += 1;
    Some(idx)
  }

  fn insert(&mut self, key: FeatureKey) -> u32 {
    let idx = self.keys.len() as u32;
    self.keys.push(key);
    self.counts.push(0);
    self.index.insert(key, idx);
    idx
  }

  /// Drops features seen fewer than `cutoff` times. Returns, for every old
  /// index, its new index if the feature survived.
  pub fn prune(&mut self, cutoff: u32) -> Vec<Option<u32>> {
    let mut remap = Vec::with_capacity(self.keys.len());
    let mut keys = Vec::new();
    let mut counts = Vec::new();
    for (key, count) in self.keys.iter().zip(self.counts.iter()) {
      if *count >= cutoff {
        remap.push(Some(keys.len() as u32));
        keys.push(*key);
        counts.push(*count);
      } else {
        remap.push(None);
      }
    }
    self.index = keys
      .iter()
      .enumerate()
      .map(|(i, k)| (*k, i as u32))
      .collect();
    self.keys = keys;
    self.counts = counts;
    remap
  }

  fn sym(&self, id: u32) -> &str {
    self.symbols.resolve(id).unwrap_or("?")
  }

  /// Human-readable, reparseable description of a feature.
  pub fn describe(&self, grammar: &Grammar, key: &FeatureKey) -> String {
    let rule = |r: &RuleId| describe_rule(grammar, *r);
    match key {
      FeatureKey::LexCat(c) => format!("lexcat {}", grammar.cat_str(*c)),
      FeatureKey::LexWord(c, w) => format!("lexword {} {}", grammar.cat_str(*c), self.sym(*w)),
      FeatureKey::LexPos(c, p) => format!("lexpos {} {}", grammar.cat_str(*c), self.sym(*p)),
      FeatureKey::Bin(r) => format!("bin {}", rule(r)),
      FeatureKey::BinWord(r, w) => format!("binword {} {}", rule(r), self.sym(*w)),
      FeatureKey::BinPos(r, p) => format!("binpos {} {}", rule(r), self.sym(*p)),
      FeatureKey::Un(r) => format!("un {}", rule(r)),
      FeatureKey::UnWord(r, w) => format!("unword {} {}", rule(r), self.sym(*w)),
      FeatureKey::DepWord(r, h, s) => {
        format!("depword {} {} {}", rule(r), self.sym(*h), self.sym(*s))
      }
      FeatureKey::DepPos(r, h, s) => format!("deppos {} {} {}", rule(r), self.sym(*h), self.sym(*s)),
      FeatureKey::Dist(r, bin) => format!("dist {} {}", rule(r), bin),
      FeatureKey::Root(c) => format!("root {}", grammar.cat_str(*c)),
      FeatureKey::RootWord(c, w) => format!("rootword {} {}", grammar.cat_str(*c), self.sym(*w)),
    }
  }

  /// Parses a description written by [`FeatureTable::describe`], interning
  /// any words it mentions.
  pub fn parse_description(&mut self, grammar: &Grammar, s: &str) -> Result<FeatureKey> {
    let fields = s.split_whitespace().collect::<Vec<_>>();
    let bad = || Error::MalformedGrammar(format!("bad feature description: {}", s));
    let (kind, rest) = fields.split_first().ok_or_else(bad)?;
    let cat = |s: &str| grammar.cat_id(s).ok_or_else(|| Error::UnknownCategory(s.to_string()));

    // (children in the rule, trailing fields)
    let shape = match *kind {
      "lexcat" | "root" | "lexword" | "lexpos" | "rootword" => None,
      "bin" => Some((2, 0)),
      "binword" | "binpos" | "dist" => Some((2, 1)),
      "depword" | "deppos" => Some((2, 2)),
      "un" => Some((1, 0)),
      "unword" => Some((1, 1)),
      _ => return Err(bad()),
    };

    let Some((children, trailing)) = shape else {
      return match (*kind, rest) {
        ("lexcat", [c]) => Ok(FeatureKey::LexCat(cat(*c)?)),
        ("root", [c]) => Ok(FeatureKey::Root(cat(*c)?)),
        ("lexword", [c, w]) => Ok(FeatureKey::LexWord(cat(*c)?, self.symbols.intern(w))),
        ("lexpos", [c, p]) => Ok(FeatureKey::LexPos(cat(*c)?, self.symbols.intern(p))),
        ("rootword", [c, w]) => Ok(FeatureKey::RootWord(cat(*c)?, self.symbols.intern(w))),
        _ => Err(bad()),
      };
    };

    if rest.len() != 2 + children + trailing {
      return Err(bad());
    }
    let combinator = rest[0].parse::<Combinator>()?;
    let result = cat(rest[1])?;
    let production = if children == 2 {
      Production::Binary(cat(rest[2])?, cat(rest[3])?)
    } else {
      Production::Unary(cat(rest[2])?)
    };
    let rule = grammar
      .find_rule(combinator, result, production)
      .ok_or_else(|| Error::UnparseableByGrammar(format!("no rule for feature: {}", s)))?;
    let extra = &rest[2 + children..];

    Ok(match (*kind, extra) {
      ("bin", []) => FeatureKey::Bin(rule),
      ("un", []) => FeatureKey::Un(rule),
      ("binword", [w]) => FeatureKey::BinWord(rule, self.symbols.intern(w)),
      ("binpos", [p]) => FeatureKey::BinPos(rule, self.symbols.intern(p)),
      ("unword", [w]) => FeatureKey::UnWord(rule, self.symbols.intern(w)),
      ("dist", [bin]) => FeatureKey::Dist(rule, bin.parse().map_err(|_| bad())?),
      ("depword", [h, d]) => {
        FeatureKey::DepWord(rule, self.symbols.intern(h), self.symbols.intern(d))
      }
      ("deppos", [h, d]) => FeatureKey::DepPos(rule, self.symbols.intern(h), self.symbols.intern(d)),
      _ => return Err(bad()),
    })
  }
}

/// `combinator result child...`
pub fn describe_rule(grammar: &Grammar, rule: RuleId) -> String {
  let Some(r) = grammar.rule(rule) else {
    return format!("? #{}", rule);
  };
  let mut out = format!("{} {}", r.combinator, grammar.cat_str(r.result));
  match r.production {
    Production::Terminal => {}
    Production::Unary(c) => {
      out.push(' ');
      out.push_str(&grammar.cat_str(c));
    }
    Production::Binary(l, rt) => {
      out.push(' ');
      out.push_str(&grammar.cat_str(l));
      out.push(' ');
      out.push_str(&grammar.cat_str(rt));
    }
  }
  out
}

/// Feature keys active on one expansion. Words the symbol source does not
/// know produce no word features.
pub fn extract(
  symbols: &mut dyn SymbolSource,
  ctx: &Context<'_>,
  expansion: &Expansion,
  rule: &Rule,
) -> Vec<FeatureKey> {
  let mut sym = |s: Option<&str>| s.and_then(|s| symbols.symbol(s));
  let mut out = Vec::new();
  match expansion {
    Expansion::Lexical { site, .. } => {
      let token = ctx.sentence.token(site.span.start);
      out.push(FeatureKey::LexCat(site.cat));
      if let Some(w) = sym(Some(token.word.as_str())) {
        out.push(FeatureKey::LexWord(site.cat, w));
      }
      if let Some(p) = sym(Some(token.pos.as_str())) {
        out.push(FeatureKey::LexPos(site.cat, p));
      }
    }
    Expansion::Unary { parent, .. } => {
      out.push(FeatureKey::Un(rule.id));
      if let Some(w) = sym(ctx.word(parent.refinement.head)) {
        out.push(FeatureKey::UnWord(rule.id, w));
      }
    }
    Expansion::Binary {
      parent,
      left,
      right,
      ..
    } => {
      let sibling = match rule.head_side() {
        Some(Side::Right) => left,
        _ => right,
      };
      let head = parent.refinement.head;
      out.push(FeatureKey::Bin(rule.id));
      let head_word = sym(ctx.word(head));
      let head_pos = sym(ctx.pos(head));
      let sibling_word = sym(ctx.word(sibling.refinement.head));
      let sibling_pos = sym(ctx.pos(sibling.refinement.head));
      if let Some(w) = head_word {
        out.push(FeatureKey::BinWord(rule.id, w));
      }
      if let Some(p) = head_pos {
        out.push(FeatureKey::BinPos(rule.id, p));
      }
      if let (Some(h), Some(s)) = (head_word, sibling_word) {
        out.push(FeatureKey::DepWord(rule.id, h, s));
      }
      if let (Some(h), Some(s)) = (head_pos, sibling_pos) {
        out.push(FeatureKey::DepPos(rule.id, h, s));
      }
      out.push(FeatureKey::Dist(
        rule.id,
        distance_bin(left.refinement.head, right.refinement.head),
      ));
    }
    Expansion::Top { root, .. } => {
      out.push(FeatureKey::Root(root.cat));
      if let Some(w) = sym(ctx.word(root.refinement.head)) {
        out.push(FeatureKey::RootWord(root.cat, w));
      }
    }
  }
  out
}

/// Companion file holding averaged weights.
pub fn averaged_path(path: impl AsRef<Path>) -> PathBuf {
  let mut s = path.as_ref().as_os_str().to_owned();
  s.push(".averaged");
  PathBuf::from(s)
}

/// Writes a weight file. `weights` is `None` for an untrained model.
pub fn write_weights(
  path: impl AsRef<Path>,
  name: &str,
  grammar: &Grammar,
  table: &FeatureTable,
  weights: Option<&[f64]>,
) -> Result<()> {
  let path = path.as_ref();
  if let Some(w) = weights {
    if w.len() != table.len() {
      return Err(Error::InvalidArgument(format!(
        "{} weights for {} features",
        w.len(),
        table.len()
      )));
    }
  }
  let mut out = BufWriter::new(File::create(path)?);
  writeln!(out, "{}", name)?;
  match weights {
    Some(w) => writeln!(out, "{}", w.len())?,
    None => writeln!(out, "-1")?,
  }
  for (i, key) in table.keys.iter().enumerate() {
    let weight = weights.map_or(0.0, |w| w[i]);
    writeln!(out, "{}\t{}\t{}", i, weight, table.describe(grammar, key))?;
  }
  out.flush()?;
  Ok(())
}

/// Reads a weight file into `table`.
///
/// Features already in `table` must sit at the index the file gives them;
/// new ones are appended and must land at that index too. Returns the model
/// name and the weights, or `None` for an untrained model.
pub fn read_weights(
  path: impl AsRef<Path>,
  grammar: &Grammar,
  table: &mut FeatureTable,
) -> Result<(String, Option<Vec<f64>>)> {
  let path = path.as_ref();
  let mut lines = BufReader::new(File::open(path)?).lines();
  let name = lines
    .next()
    .transpose()?
    .ok_or_else(|| Error::serialization(path, "missing model name"))?;
  let declared = lines
    .next()
    .transpose()?
    .ok_or_else(|| Error::serialization(path, "missing weight count"))?;
  let declared = declared
    .trim()
    .parse::<i64>()
    .map_err(|e| Error::serialization(path, format!("bad weight count: {}", e)))?;

  let mut weights = Vec::new();
  for (i, line) in lines.enumerate() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    let lineno = i + 3;
    let mut fields = line.splitn(3, '\t');
    let (Some(idx), Some(weight), Some(desc)) = (fields.next(), fields.next(), fields.next()) else {
      return Err(Error::serialization(path, format!("line {}: expected 3 fields", lineno)));
    };
    let idx = idx
      .parse::<u32>()
      .map_err(|e| Error::serialization(path, format!("line {}: {}", lineno, e)))?;
    let weight = weight
      .parse::<f64>()
      .map_err(|e| Error::serialization(path, format!("line {}: {}", lineno, e)))?;
    let key = table.parse_description(grammar, desc)?;

    let mismatch = |reason: String| Error::FeatureIndexMismatch {
      line: lineno,
      reason,
    };
    match table.get(&key) {
      Some(existing) if existing == idx => {}
      Some(existing) => {
        return Err(mismatch(format!("'{}' is feature {} here, not {}", desc, existing, idx)));
      }
      None if table.is_frozen() => {
        return Err(mismatch(format!("'{}' is not in the frozen table", desc)));
      }
      None => {
        let added = table.insert(key);
        if added != idx {
          return Err(mismatch(format!("'{}' would be feature {}, not {}", desc, added, idx)));
        }
      }
    }
    if idx as usize >= weights.len() {
      weights.resize(idx as usize + 1, 0.0);
    }
    weights[idx as usize] = weight;
  }

  weights.resize(table.len(), 0.0);
  if declared >= 0 && declared as usize != table.len() {
    return Err(Error::serialization(
      path,
      format!("declares {} weights but lists {}", declared, table.len()),
    ));
  }
  Ok((name, (declared >= 0).then_some(weights)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Refinement, Site};
  use crate::test_utils::*;
  use crate::utils::Span;

  fn sample(g: &Grammar) -> FeatureTable {
    let mut table = FeatureTable::new();
    let np = g.cat_id("NP").unwrap();
    let ba = g
      .find_rule(
        Combinator::BwdApp,
        g.cat_id("S").unwrap(),
        Production::Binary(np, g.cat_id("S\\NP").unwrap()),
      )
      .unwrap();
    let dog = table.symbols.intern("dog");
    let runs = table.symbols.intern("runs");
    table.register(FeatureKey::LexCat(g.cat_id("N").unwrap()));
    table.register(FeatureKey::Bin(ba));
    table.register(FeatureKey::DepWord(ba, runs, dog));
    table.register(FeatureKey::Dist(ba, 0));
    table.register(FeatureKey::LexWord(np, dog));
    table
  }

  #[test]
  fn test_register_and_prune() {
    let g = toy_grammar();
    let mut table = sample(&g);
    let n = FeatureKey::LexCat(g.cat_id("N").unwrap());
    assert_eq!(table.register(n), Some(0));
    assert_eq!(table.count(0), 2);

    table.freeze();
    assert_eq!(table.register(FeatureKey::Root(0)), None);
    assert_eq!(table.len(), 5);

    let remap = table.prune(2);
    assert_eq!(remap, vec![Some(0), None, None, None, None]);
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(&n), Some(0));
  }

  #[test]
  fn test_descriptions_reparse() {
    let g = toy_grammar();
    let mut table = sample(&g);
    for i in 0..table.len() as u32 {
      let key = table.key(i).unwrap();
      let desc = table.describe(&g, &key);
      assert_eq!(table.parse_description(&g, &desc).unwrap(), key, "{}", desc);
    }
    assert_eq!(table.describe(&g, &table.key(1).unwrap()), "bin ba S NP S\\NP");
    assert!(table.parse_description(&g, "bin fa S NP").is_err());
  }

  #[test]
  fn test_weight_file_round_trip() {
    let g = toy_grammar();
    let table = sample(&g);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights");
    let weights = vec![0.5, -1.0, 2.25, 0.0, 3.0];
    write_weights(&path, "perceptron", &g, &table, Some(&weights)).unwrap();

    let mut loaded = FeatureTable::new();
    let (name, got) = read_weights(&path, &g, &mut loaded).unwrap();
    assert_eq!(name, "perceptron");
    assert_eq!(got, Some(weights));
    assert_eq!(loaded.len(), table.len());
    for i in 0..table.len() as u32 {
      assert_eq!(
        loaded.describe(&g, &loaded.key(i).unwrap()),
        table.describe(&g, &table.key(i).unwrap())
      );
    }

    write_weights(&path, "perceptron", &g, &table, None).unwrap();
    let mut untrained = FeatureTable::new();
    let (_, none) = read_weights(&path, &g, &mut untrained).unwrap();
    assert_eq!(none, None);
    assert_eq!(untrained.len(), 5);
    assert_eq!(averaged_path(&path), dir.path().join("weights.averaged"));
  }

  #[test]
  fn test_index_mismatch() {
    let g = toy_grammar();
    let table = sample(&g);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights");
    write_weights(&path, "perceptron", &g, &table, None).unwrap();

    // a table that already has a different feature at index 0
    let mut other = FeatureTable::new();
    other.register(FeatureKey::Root(g.cat_id("S").unwrap()));
    assert!(matches!(
      read_weights(&path, &g, &mut other),
      Err(Error::FeatureIndexMismatch { line: 3, .. })
    ));

    std::fs::write(&path, "perceptron\n1\n4\t1.0\tlexcat N\n").unwrap();
    assert!(matches!(
      read_weights(&path, &g, &mut FeatureTable::new()),
      Err(Error::FeatureIndexMismatch { .. })
    ));
  }

  #[test]
  fn test_extract_binary_features() {
    let g = toy_grammar();
    let s = the_dog_runs();
    let ctx = Context::new(&g, &s);
    let np = g.cat_id("NP").unwrap();
    let vp = g.cat_id("S\\NP").unwrap();
    let rule_id = g
      .find_rule(Combinator::BwdApp, g.cat_id("S").unwrap(), Production::Binary(np, vp))
      .unwrap();
    let rule = g.rule(rule_id).unwrap();
    let head = |h| Refinement {
      head: Some(h),
      lexcat: None,
    };
    let left = Site::new(np, Span::new(0, 2), head(1));
    let right = Site::new(vp, Span::new(2, 3), head(2));
    let parent = Site::new(rule.result, Span::new(0, 3), head(2));
    let mut symbols = Symbols::new();
    let keys = extract(
      &mut symbols,
      &ctx,
      &Expansion::Binary {
        rule: rule_id,
        parent,
        left,
        right,
      },
      rule,
    );
    let runs = symbols.get("runs").unwrap();
    let dog = symbols.get("dog").unwrap();
    assert!(keys.contains(&FeatureKey::Bin(rule_id)));
    assert!(keys.contains(&FeatureKey::DepWord(rule_id, runs, dog)));
    assert!(keys.contains(&FeatureKey::Dist(rule_id, 0)));
  }
}
