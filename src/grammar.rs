use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::auto::AutoNode;
use crate::category::{Category, Slash};
use crate::errors::{Error, Result};
use crate::rules::{CatId, Combinator, Production, Rule, RuleId, RuleType, Side};
use crate::sentence::Sentence;

static NEXT_GRAMMAR_ID: AtomicU32 = AtomicU32::new(1);

/// Which argument of a lexical category supplies the head of the phrase it
/// builds, and which arguments are filled without producing a dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markup {
  pub head_slot: Option<usize>,
  pub silent: Vec<usize>,
}

impl Markup {
  pub fn head_from(slot: usize) -> Self {
    Self {
      head_slot: Some(slot),
      silent: Vec::new(),
    }
  }

  pub fn silent(mut self, slot: usize) -> Self {
    self.silent.push(slot);
    self
  }

  pub fn is_silent(&self, slot: usize) -> bool {
    self.silent.contains(&slot)
  }
}

/// Applies one combinatory schema to a pair of categories.
///
/// Returns `None` whenever the schema does not apply. The result may not be in
/// any codebook: callers decide whether unknown results are admissible.
pub fn apply(combinator: Combinator, left: &Category, right: &Category) -> Option<Category> {
  match combinator {
    Combinator::FwdApp => {
      let (x, slash, y) = left.split()?;
      if slash != Slash::Forward {
        return None;
      }
      y.matches(right).map(|b| x.substitute(&b))
    }
    Combinator::BwdApp => {
      let (x, slash, y) = right.split()?;
      if slash != Slash::Backward {
        return None;
      }
      y.matches(left).map(|b| x.substitute(&b))
    }
    Combinator::FwdComp => {
      let (x, s1, y) = left.split()?;
      let (y2, s2, z) = right.split()?;
      if s1 != Slash::Forward || s2 != Slash::Forward {
        return None;
      }
      y.matches(y2)
        .map(|b| Category::functor(x.substitute(&b), Slash::Forward, z.clone()))
    }
    Combinator::BwdComp => {
      let (y2, s2, z) = left.split()?;
      let (x, s1, y) = right.split()?;
      if s1 != Slash::Backward || s2 != Slash::Backward {
        return None;
      }
      y.matches(y2)
        .map(|b| Category::functor(x.substitute(&b), Slash::Backward, z.clone()))
    }
    Combinator::BwdCrossComp => {
      let (y2, s2, z) = left.split()?;
      let (x, s1, y) = right.split()?;
      // only verbal arguments cross, otherwise this rule overgenerates wildly
      if s1 != Slash::Backward || s2 != Slash::Forward || !y.is_functor() {
        return None;
      }
      y.matches(y2)
        .map(|b| Category::functor(x.substitute(&b), Slash::Forward, z.clone()))
    }
    Combinator::Conj => {
      if left.is_conjunction() && !right.is_punct() && !right.is_conj() {
        Some(right.clone().conj())
      } else {
        None
      }
    }
    Combinator::Coord => match right {
      Category::Conj(inner) if inner.matches(left).is_some() && !left.is_conj() => {
        Some(left.clone())
      }
      _ => None,
    },
    Combinator::LeftPunct => {
      if left.is_punct() && !right.is_punct() {
        Some(right.clone())
      } else {
        None
      }
    }
    Combinator::RightPunct => {
      if right.is_punct() && !left.is_punct() {
        Some(left.clone())
      } else {
        None
      }
    }
    _ => None,
  }
}

/// `T/(T\X)` or `T\(T/X)`.
pub fn is_raised(cat: &Category) -> bool {
  match cat.split() {
    Some((t, s1, arg)) => match arg.split() {
      Some((t2, s2, _)) => s1 != s2 && t == t2,
      None => false,
    },
    None => false,
  }
}

pub fn raise(x: &Category, t: &Category, slash: Slash) -> Category {
  let inner = match slash {
    Slash::Forward => Slash::Backward,
    Slash::Backward => Slash::Forward,
  };
  Category::functor(t.clone(), slash, Category::functor(t.clone(), inner, x.clone()))
}

/// The CCG grammar: a codebook of categories and rule instances plus indexes
/// for the chart.
///
/// Ids are dense, stable for the lifetime of the instance, and tied to it: each
/// grammar gets a fresh instance id, so charts and models can refuse to be
/// mixed with a different grammar.
#[derive(Debug)]
pub struct Grammar {
  id: u32,
  categories: Vec<Category>,
  cat_ids: HashMap<String, CatId>,
  lexical: Vec<bool>,
  rules: Vec<Rule>,
  binary: HashMap<(CatId, CatId), Vec<RuleId>>,
  by_left: HashMap<CatId, Vec<RuleId>>,
  by_right: HashMap<CatId, Vec<RuleId>>,
  unary: HashMap<CatId, Vec<RuleId>>,
  lexical_rules: HashMap<CatId, RuleId>,
  top_rules: HashMap<CatId, RuleId>,
  start: Vec<CatId>,
  markup: HashMap<CatId, Markup>,
}

impl fmt::Display for Grammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "//** grammar #{}", self.id)?;
    write!(f, "//** start:")?;
    for s in self.start.iter() {
      write!(f, " {}", self.categories[*s as usize])?;
    }
    writeln!(f)?;
    for rule in self.rules.iter() {
      writeln!(f, "{}", self.display_rule(rule))?;
    }
    Ok(())
  }
}

impl Grammar {
  pub fn builder() -> GrammarBuilder {
    GrammarBuilder::new()
  }

  /// Instance id; never shared between two grammars in one process.
  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn check(&self, expected: u32) -> Result<()> {
    if expected == self.id {
      Ok(())
    } else {
      Err(Error::GrammarMismatch {
        expected,
        found: self.id,
      })
    }
  }

  pub fn num_categories(&self) -> usize {
    self.categories.len()
  }

  pub fn category(&self, id: CatId) -> &Category {
    &self.categories[id as usize]
  }

  pub fn cat_str(&self, id: CatId) -> String {
    self.category(id).to_string()
  }

  pub fn cat_id_of(&self, cat: &Category) -> Option<CatId> {
    self.cat_ids.get(&cat.to_string()).copied()
  }

  /// Looks up a category string; unparseable or unknown strings yield `None`.
  pub fn cat_id(&self, s: &str) -> Option<CatId> {
    if let Some(id) = self.cat_ids.get(s) {
      return Some(*id);
    }
    s.parse::<Category>().ok().and_then(|c| self.cat_id_of(&c))
  }

  pub fn require_cat(&self, s: &str) -> Result<CatId> {
    self
      .cat_id(s)
      .ok_or_else(|| Error::UnknownCategory(s.to_string()))
  }

  pub fn is_lexical(&self, cat: CatId) -> bool {
    self.lexical.get(cat as usize).copied().unwrap_or(false)
  }

  pub fn rules(&self) -> &[Rule] {
    &self.rules
  }

  pub fn rule(&self, id: RuleId) -> Option<&Rule> {
    self.rules.get(id as usize)
  }

  pub fn binary_rules(&self, left: CatId, right: CatId) -> &[RuleId] {
    self
      .binary
      .get(&(left, right))
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Candidate binary rules in which `cat` is the child on `side`.
  pub fn rules_for(&self, cat: CatId, side: Side) -> &[RuleId] {
    let index = match side {
      Side::Left => &self.by_left,
      Side::Right => &self.by_right,
    };
    index.get(&cat).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn unary_rules(&self, child: CatId) -> &[RuleId] {
    self.unary.get(&child).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn lexical_rule(&self, cat: CatId) -> Option<RuleId> {
    self.lexical_rules.get(&cat).copied()
  }

  pub fn top_rule(&self, cat: CatId) -> Option<RuleId> {
    self.top_rules.get(&cat).copied()
  }

  pub fn is_start(&self, cat: CatId) -> bool {
    self.top_rules.contains_key(&cat)
  }

  pub fn start_categories(&self) -> &[CatId] {
    &self.start
  }

  /// The result of `rule` if it applies to exactly these children.
  pub fn combine(&self, rule: RuleId, left: CatId, right: CatId) -> Option<CatId> {
    let rule = self.rule(rule)?;
    match rule.production {
      Production::Binary(l, r) if l == left && r == right => Some(rule.result),
      _ => None,
    }
  }

  /// The result of unary `rule` applied to `child`.
  pub fn combine_unary(&self, rule: RuleId, child: CatId) -> Option<CatId> {
    let rule = self.rule(rule)?;
    match rule.production {
      Production::Unary(c) if c == child => Some(rule.result),
      _ => None,
    }
  }

  /// Finds a rule by its combinator, result and children.
  pub fn find_rule(&self, combinator: Combinator, result: CatId, production: Production) -> Option<RuleId> {
    let candidates: &[RuleId] = match production {
      Production::Terminal => return self.lexical_rule(result).filter(|_| combinator == Combinator::Lexical),
      Production::Unary(c) if combinator == Combinator::Top => {
        return self.top_rule(c).filter(|_| c == result);
      }
      Production::Unary(c) => self.unary_rules(c),
      Production::Binary(l, r) => self.binary_rules(l, r),
    };
    candidates.iter().copied().find(|id| {
      let rule = &self.rules[*id as usize];
      rule.combinator == combinator && rule.result == result
    })
  }

  /// Can every gold lexical category in the sentence be produced lexically?
  pub fn licenses(&self, sentence: &Sentence) -> bool {
    sentence.tokens().iter().all(|t| match &t.gold {
      Some(gold) => self
        .cat_id(gold)
        .is_some_and(|c| self.lexical_rule(c).is_some()),
      None => true,
    })
  }

  /// Markup for `cat`, falling back to the modifier / type-raising defaults.
  pub fn markup(&self, cat: CatId) -> Markup {
    if let Some(m) = self.markup.get(&cat) {
      return m.clone();
    }
    default_markup(self.category(cat))
  }

  pub fn display_rule(&self, rule: &Rule) -> String {
    let children = match rule.production {
      Production::Terminal => "<word>".to_string(),
      Production::Unary(c) => self.cat_str(c),
      Production::Binary(l, r) => format!("{} {}", self.cat_str(l), self.cat_str(r)),
    };
    format!(
      "{} -> {} ({}, {:?}, count {})",
      self.cat_str(rule.result),
      children,
      rule.combinator,
      rule.rule_type,
      rule.count
    )
  }

  fn index(
    id: u32,
    categories: Vec<Category>,
    lexical: Vec<bool>,
    rules: Vec<Rule>,
    markup: HashMap<CatId, Markup>,
  ) -> Result<Self> {
    let mut cat_ids = HashMap::new();
    for (idx, cat) in categories.iter().enumerate() {
      if cat_ids.insert(cat.to_string(), idx as CatId).is_some() {
        return Err(Error::MalformedGrammar(format!("duplicate category {}", cat)));
      }
    }

    let mut g = Self {
      id,
      categories,
      cat_ids,
      lexical,
      rules: Vec::new(),
      binary: HashMap::new(),
      by_left: HashMap::new(),
      by_right: HashMap::new(),
      unary: HashMap::new(),
      lexical_rules: HashMap::new(),
      top_rules: HashMap::new(),
      start: Vec::new(),
      markup,
    };

    let ncats = g.categories.len() as CatId;
    let in_range = |c: CatId| -> Result<()> {
      if c < ncats {
        Ok(())
      } else {
        Err(Error::MalformedGrammar(format!("category id {} out of range", c)))
      }
    };

    for (idx, rule) in rules.iter().enumerate() {
      if rule.id as usize != idx {
        return Err(Error::MalformedGrammar(format!(
          "rule id {} at position {}",
          rule.id, idx
        )));
      }
      in_range(rule.result)?;
      match (rule.rule_type, rule.production) {
        (RuleType::Lexical, Production::Terminal) => {
          g.lexical_rules.insert(rule.result, rule.id);
          g.lexical[rule.result as usize] = true;
        }
        (RuleType::Top, Production::Unary(c)) => {
          in_range(c)?;
          g.top_rules.insert(c, rule.id);
          g.start.push(c);
        }
        (RuleType::Unary, Production::Unary(c)) => {
          in_range(c)?;
          g.unary.entry(c).or_default().push(rule.id);
        }
        (t, Production::Binary(l, r)) if t.is_binary() => {
          in_range(l)?;
          in_range(r)?;
          g.binary.entry((l, r)).or_default().push(rule.id);
          g.by_left.entry(l).or_default().push(rule.id);
          g.by_right.entry(r).or_default().push(rule.id);
        }
        (t, p) => {
          return Err(Error::MalformedGrammar(format!(
            "rule {} has type {:?} but production {:?}",
            rule.id, t, p
          )));
        }
      }
    }
    g.rules = rules;

    if g.start.is_empty() {
      return Err(Error::MalformedGrammar("no start category".to_string()));
    }

    Ok(g)
  }

  /// Writes the codebook into `dir` (created if missing).
  pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut w = BufWriter::new(fs::File::create(dir.join("categories"))?);
    for (idx, cat) in self.categories.iter().enumerate() {
      writeln!(w, "{}\t{}\t{}", idx, cat, self.lexical[idx] as u8)?;
    }
    w.flush()?;

    let mut w = BufWriter::new(fs::File::create(dir.join("rules"))?);
    for rule in self.rules.iter() {
      let (l, r) = rule.children();
      let show = |c: Option<CatId>| c.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
      writeln!(
        w,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        rule.id,
        rule_type_str(rule.rule_type),
        rule.combinator,
        rule.result,
        show(l),
        show(r),
        rule.count
      )?;
    }
    w.flush()?;

    let mut w = BufWriter::new(fs::File::create(dir.join("start"))?);
    for cat in self.start.iter() {
      writeln!(w, "{}", self.categories[*cat as usize])?;
    }
    w.flush()?;

    let mut w = BufWriter::new(fs::File::create(dir.join("markedup"))?);
    let mut marked = self.markup.iter().collect::<Vec<_>>();
    marked.sort_by_key(|(c, _)| **c);
    for (cat, m) in marked {
      let head = m.head_slot.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
      let silent = if m.silent.is_empty() {
        "-".to_string()
      } else {
        m.silent.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",")
      };
      writeln!(w, "{}\t{}\t{}", self.categories[*cat as usize], head, silent)?;
    }
    w.flush()?;

    info!(dir = %dir.display(), categories = self.categories.len(), rules = self.rules.len(), "saved grammar");
    Ok(())
  }

  /// Reads a codebook written by [`Grammar::save`]. Ids come back exactly as saved.
  pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref();

    let path = dir.join("categories");
    let mut categories = Vec::new();
    let mut lexical = Vec::new();
    for (lineno, line) in read_lines(&path)?.into_iter().enumerate() {
      let fields = line.split('\t').collect::<Vec<_>>();
      if fields.len() != 3 || fields[0].parse::<usize>().ok() != Some(lineno) {
        return Err(Error::MalformedGrammar(format!(
          "{}:{}: expected `id<TAB>category<TAB>lexical`",
          path.display(),
          lineno + 1
        )));
      }
      let cat = fields[1]
        .parse::<Category>()
        .map_err(|_| Error::UnknownCategory(fields[1].to_string()))?;
      categories.push(cat);
      // the flag is re-derived from the lexical rules below
      lexical.push(false);
    }

    let path = dir.join("rules");
    let mut rules = Vec::new();
    for (lineno, line) in read_lines(&path)?.into_iter().enumerate() {
      rules.push(parse_rule_line(&line).map_err(|e| {
        Error::MalformedGrammar(format!("{}:{}: {}", path.display(), lineno + 1, e))
      })?);
    }

    let mut cat_ids = HashMap::new();
    for (idx, cat) in categories.iter().enumerate() {
      cat_ids.insert(cat.to_string(), idx as CatId);
    }
    let mut markup = HashMap::new();
    let path = dir.join("markedup");
    if path.exists() {
      for line in read_lines(&path)? {
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() != 3 {
          return Err(Error::MalformedGrammar(format!("bad markup line: {}", line)));
        }
        let cat = fields[0]
          .parse::<Category>()
          .ok()
          .and_then(|c| cat_ids.get(&c.to_string()).copied())
          .ok_or_else(|| Error::UnknownCategory(fields[0].to_string()))?;
        markup.insert(cat, parse_markup(fields[1], fields[2])?);
      }
    }

    let id = NEXT_GRAMMAR_ID.fetch_add(1, Ordering::Relaxed);
    let g = Self::index(id, categories, lexical, rules, markup)?;

    let path = dir.join("start");
    if path.exists() {
      for line in read_lines(&path)? {
        let cat = g.require_cat(line.trim())?;
        if !g.is_start(cat) {
          return Err(Error::MalformedGrammar(format!(
            "start category {} has no top rule",
            line.trim()
          )));
        }
      }
    }
    info!(dir = %dir.display(), id = g.id, categories = g.categories.len(), rules = g.rules.len(), "loaded grammar");
    Ok(g)
  }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
  let f = fs::File::open(path)?;
  let mut lines = Vec::new();
  for line in BufReader::new(f).lines() {
    let line = line?;
    if !line.trim().is_empty() {
      lines.push(line);
    }
  }
  Ok(lines)
}

fn rule_type_str(t: RuleType) -> &'static str {
  match t {
    RuleType::Lexical => "lex",
    RuleType::LeftBinary => "left",
    RuleType::RightBinary => "right",
    RuleType::Unary => "unary",
    RuleType::Top => "top",
  }
}

fn parse_rule_line(line: &str) -> std::result::Result<Rule, String> {
  let fields = line.split('\t').collect::<Vec<_>>();
  if fields.len() != 7 {
    return Err(format!("expected 7 fields, got {}", fields.len()));
  }
  let num = |s: &str| s.parse::<u32>().map_err(|e| format!("{}: {}", s, e));
  let opt = |s: &str| -> std::result::Result<Option<u32>, String> {
    if s == "-" { Ok(None) } else { num(s).map(Some) }
  };
  let rule_type = match fields[1] {
    "lex" => RuleType::Lexical,
    "left" => RuleType::LeftBinary,
    "right" => RuleType::RightBinary,
    "unary" => RuleType::Unary,
    "top" => RuleType::Top,
    other => return Err(format!("unknown rule type {}", other)),
  };
  let combinator = fields[2].parse::<Combinator>().map_err(|e| e.to_string())?;
  let production = match (opt(fields[4])?, opt(fields[5])?) {
    (None, None) => Production::Terminal,
    (Some(c), None) => Production::Unary(c),
    (Some(l), Some(r)) => Production::Binary(l, r),
    (None, Some(_)) => return Err("right child without left child".to_string()),
  };
  Ok(Rule {
    id: num(fields[0])?,
    rule_type,
    combinator,
    result: num(fields[3])?,
    production,
    count: num(fields[6])?,
  })
}

fn parse_markup(head: &str, silent: &str) -> Result<Markup> {
  let bad = || Error::MalformedGrammar(format!("bad markup: {} {}", head, silent));
  let head_slot = if head == "-" {
    None
  } else {
    Some(head.parse::<usize>().map_err(|_| bad())?)
  };
  let silent = if silent == "-" {
    Vec::new()
  } else {
    silent
      .split(',')
      .map(|s| s.parse::<usize>().map_err(|_| bad()))
      .collect::<Result<Vec<_>>>()?
  };
  Ok(Markup { head_slot, silent })
}

fn default_markup(cat: &Category) -> Markup {
  if cat.is_modifier() || is_raised(cat) {
    // only the modified argument yields a dependency
    Markup {
      head_slot: Some(cat.arity()),
      silent: (1..cat.arity()).collect(),
    }
  } else {
    Markup::default()
  }
}

/// Does the outermost argument of this functor supply the head?
fn head_from_outer(cat: &Category, markup: Option<&Markup>) -> bool {
  let markup = markup.cloned().unwrap_or_else(|| default_markup(cat));
  cat.is_functor() && markup.head_slot == Some(cat.arity())
}

/// Builds a [`Grammar`] from category lists, observed derivations and
/// combinator schemas.
#[derive(Debug)]
pub struct GrammarBuilder {
  categories: Vec<Category>,
  index: HashMap<String, CatId>,
  lexical: BTreeMap<CatId, u32>,
  start: BTreeMap<CatId, u32>,
  observed_binary: BTreeMap<(CatId, CatId, CatId), u32>,
  observed_unary: BTreeMap<(CatId, CatId), u32>,
  combinators: BTreeSet<Combinator>,
  type_raising: Vec<(Category, Category)>,
  type_changes: Vec<(Category, Category)>,
  markup: Vec<(Category, Markup)>,
  enumerate: bool,
  min_count: u32,
}

impl Default for GrammarBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl GrammarBuilder {
  pub fn new() -> Self {
    let determiner = Markup::head_from(1).silent(1);
    Self {
      categories: Vec::new(),
      index: HashMap::new(),
      lexical: BTreeMap::new(),
      start: BTreeMap::new(),
      observed_binary: BTreeMap::new(),
      observed_unary: BTreeMap::new(),
      combinators: Combinator::BINARY.iter().copied().collect(),
      type_raising: Vec::new(),
      type_changes: Vec::new(),
      markup: vec![
        (Category::functor(Category::atom("NP"), Slash::Forward, Category::atom("N")), determiner.clone()),
        (
          Category::functor(Category::featured("NP", "nb"), Slash::Forward, Category::atom("N")),
          determiner,
        ),
      ],
      enumerate: true,
      min_count: 0,
    }
  }

  fn add(&mut self, cat: Category) -> CatId {
    let key = cat.to_string();
    if let Some(id) = self.index.get(&key) {
      return *id;
    }
    let id = self.categories.len() as CatId;
    self.categories.push(cat);
    self.index.insert(key, id);
    id
  }

  fn parse(s: &str) -> Result<Category> {
    s.parse::<Category>()
      .map_err(|_| Error::UnknownCategory(s.to_string()))
  }

  /// Adds a (non-lexical) category to the codebook.
  pub fn category(&mut self, s: &str) -> Result<CatId> {
    let cat = Self::parse(s)?;
    Ok(self.add(cat))
  }

  /// Adds a category that words may carry.
  pub fn lexical(&mut self, s: &str) -> Result<CatId> {
    let id = self.category(s)?;
    self.lexical.entry(id).or_insert(0);
    Ok(id)
  }

  /// Adds a category that may span a whole sentence.
  pub fn start(&mut self, s: &str) -> Result<CatId> {
    let id = self.category(s)?;
    self.start.entry(id).or_insert(0);
    Ok(id)
  }

  /// Restricts the binary schemas to exactly `combinators`.
  pub fn combinators(&mut self, combinators: &[Combinator]) -> &mut Self {
    self.combinators = combinators.iter().copied().collect();
    self
  }

  pub fn disable(&mut self, combinator: Combinator) -> &mut Self {
    self.combinators.remove(&combinator);
    self
  }

  /// Adds `X => T/(T\X)` and `X => T\(T/X)`.
  pub fn type_raise(&mut self, x: &str, t: &str) -> Result<&mut Self> {
    let x = Self::parse(x)?;
    let t = Self::parse(t)?;
    self.add(x.clone());
    self.add(raise(&x, &t, Slash::Forward));
    self.add(raise(&x, &t, Slash::Backward));
    self.type_raising.push((x, t));
    Ok(self)
  }

  /// Adds a unary type-changing rule `from => to`.
  pub fn type_change(&mut self, from: &str, to: &str) -> Result<&mut Self> {
    let from = Self::parse(from)?;
    let to = Self::parse(to)?;
    self.add(from.clone());
    self.add(to.clone());
    self.type_changes.push((from, to));
    Ok(self)
  }

  pub fn markup(&mut self, cat: &str, markup: Markup) -> Result<&mut Self> {
    let cat = Self::parse(cat)?;
    self.add(cat.clone());
    self.markup.retain(|(c, _)| *c != cat);
    self.markup.push((cat, markup));
    Ok(self)
  }

  /// Whether to enumerate every schema over every category pair, or only keep
  /// rules seen through [`GrammarBuilder::observe`].
  pub fn enumerate(&mut self, enumerate: bool) -> &mut Self {
    self.enumerate = enumerate;
    self
  }

  /// Drops non-lexical rules seen fewer than `count` times.
  pub fn min_rule_count(&mut self, count: u32) -> &mut Self {
    self.min_count = count;
    self
  }

  /// Records the categories and rule instances of one gold derivation.
  pub fn observe(&mut self, tree: &AutoNode) -> Result<()> {
    let root = self.observe_node(tree)?;
    *self.start.entry(root).or_insert(0) += 1;
    Ok(())
  }

  fn observe_node(&mut self, node: &AutoNode) -> Result<CatId> {
    let cat = self.add(node.cat.clone());
    match node.children.as_slice() {
      [] => {
        *self.lexical.entry(cat).or_insert(0) += 1;
      }
      [child] => {
        let c = self.observe_node(child)?;
        *self.observed_unary.entry((c, cat)).or_insert(0) += 1;
      }
      [left, right] => {
        let l = self.observe_node(left)?;
        let r = self.observe_node(right)?;
        *self.observed_binary.entry((l, r, cat)).or_insert(0) += 1;
      }
      _ => {
        return Err(Error::MalformedGrammar(format!(
          "node {} has {} children",
          node.cat,
          node.children.len()
        )));
      }
    }
    Ok(cat)
  }

  fn head_side(&self, combinator: Combinator, left: &Category, right: &Category) -> Side {
    let marked = |c: &Category| self.markup.iter().find(|(m, _)| m == c).map(|(_, m)| m);
    match combinator {
      Combinator::FwdApp | Combinator::FwdComp => {
        if head_from_outer(left, marked(left)) { Side::Right } else { Side::Left }
      }
      Combinator::BwdApp | Combinator::BwdComp | Combinator::BwdCrossComp => {
        if head_from_outer(right, marked(right)) { Side::Left } else { Side::Right }
      }
      Combinator::Conj | Combinator::LeftPunct => Side::Right,
      _ => Side::Left,
    }
  }

  pub fn build(&self) -> Result<Grammar> {
    let mut categories = self.categories.clone();
    let mut index = self.index.clone();

    let mut binary: BTreeMap<(CatId, CatId, Combinator, CatId), u32> = BTreeMap::new();
    let known = categories.len() as CatId;
    if self.enumerate {
      for l in 0..known {
        for r in 0..known {
          for comb in self.combinators.iter() {
            let result = apply(*comb, &categories[l as usize], &categories[r as usize]);
            if let Some(id) = result.and_then(|c| index.get(&c.to_string()).copied()) {
              binary.insert((l, r, *comb, id), 0);
            }
          }
        }
      }
    }
    for ((l, r, result), count) in self.observed_binary.iter() {
      let (lc, rc) = (&categories[*l as usize], &categories[*r as usize]);
      let comb = self
        .combinators
        .iter()
        .find(|comb| {
          apply(**comb, lc, rc).is_some_and(|c| c == categories[*result as usize])
        })
        .copied()
        .unwrap_or(Combinator::Observed);
      *binary.entry((*l, *r, comb, *result)).or_insert(0) += count;
    }

    let mut intern = |cat: Category, categories: &mut Vec<Category>| -> CatId {
      let key = cat.to_string();
      if let Some(id) = index.get(&key) {
        return *id;
      }
      let id = categories.len() as CatId;
      categories.push(cat);
      index.insert(key, id);
      id
    };
    let mut unary: BTreeMap<(CatId, Combinator, CatId), u32> = BTreeMap::new();
    for (x, t) in self.type_raising.iter() {
      let child = intern(x.clone(), &mut categories);
      let fwd = intern(raise(x, t, Slash::Forward), &mut categories);
      let bwd = intern(raise(x, t, Slash::Backward), &mut categories);
      unary.insert((child, Combinator::FwdRaise, fwd), 0);
      unary.insert((child, Combinator::BwdRaise, bwd), 0);
    }
    for (from, to) in self.type_changes.iter() {
      let from = intern(from.clone(), &mut categories);
      let to = intern(to.clone(), &mut categories);
      unary.insert((from, Combinator::TypeChange, to), 0);
    }
    for ((child, result), count) in self.observed_unary.iter() {
      let (c, r) = (&categories[*child as usize], &categories[*result as usize]);
      let comb = if is_raised(r) {
        match r.split() {
          Some((_, Slash::Forward, _)) => Combinator::FwdRaise,
          _ => Combinator::BwdRaise,
        }
      } else {
        Combinator::TypeChange
      };
      debug!(child = %c, result = %r, %comb, "observed unary rule");
      *unary.entry((*child, comb, *result)).or_insert(0) += count;
    }

    let mut rules = Vec::new();
    let push = |rules: &mut Vec<Rule>, rule_type, combinator, result, production, count| {
      let id = rules.len() as RuleId;
      rules.push(Rule {
        id,
        rule_type,
        combinator,
        result,
        production,
        count,
      });
    };

    for (cat, count) in self.lexical.iter() {
      push(&mut rules, RuleType::Lexical, Combinator::Lexical, *cat, Production::Terminal, *count);
    }
    let mut pruned = 0;
    for ((l, r, comb, result), count) in binary {
      if count < self.min_count {
        pruned += 1;
        continue;
      }
      let rule_type = match self.head_side(comb, &categories[l as usize], &categories[r as usize]) {
        Side::Left => RuleType::LeftBinary,
        Side::Right => RuleType::RightBinary,
      };
      push(&mut rules, rule_type, comb, result, Production::Binary(l, r), count);
    }
    for ((child, comb, result), count) in unary {
      if count < self.min_count {
        pruned += 1;
        continue;
      }
      push(&mut rules, RuleType::Unary, comb, result, Production::Unary(child), count);
    }
    for (cat, count) in self.start.iter() {
      push(&mut rules, RuleType::Top, Combinator::Top, *cat, Production::Unary(*cat), *count);
    }

    let mut markup = HashMap::new();
    for (cat, m) in self.markup.iter() {
      if let Some(id) = index.get(&cat.to_string()) {
        markup.insert(*id, m.clone());
      }
    }

    let lexical = vec![false; categories.len()];
    let id = NEXT_GRAMMAR_ID.fetch_add(1, Ordering::Relaxed);
    let g = Grammar::index(id, categories, lexical, rules, markup)?;
    info!(
      id = g.id,
      categories = g.num_categories(),
      rules = g.rules.len(),
      pruned,
      "built grammar"
    );
    Ok(g)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sentence::Token;

  fn cat(s: &str) -> Category {
    s.parse().unwrap()
  }

  #[test]
  fn test_application_and_composition() {
    assert_eq!(apply(Combinator::FwdApp, &cat("NP/N"), &cat("N")), Some(cat("NP")));
    assert_eq!(apply(Combinator::BwdApp, &cat("NP"), &cat("S[dcl]\\NP")), Some(cat("S[dcl]")));
    assert_eq!(apply(Combinator::FwdApp, &cat("NP/N"), &cat("NP")), None);
    assert_eq!(
      apply(Combinator::FwdComp, &cat("(S\\NP)/(S\\NP)"), &cat("(S[b]\\NP)/NP")),
      Some(cat("(S[b]\\NP)/NP"))
    );
    assert_eq!(
      apply(Combinator::BwdComp, &cat("S\\NP"), &cat("S\\S")),
      Some(cat("S\\NP"))
    );
    assert_eq!(
      apply(Combinator::BwdCrossComp, &cat("(S[dcl]\\NP)/NP"), &cat("(S\\NP)\\(S\\NP)")),
      Some(cat("(S[dcl]\\NP)/NP"))
    );
  }

  #[test]
  fn test_coordination_and_punctuation() {
    assert_eq!(apply(Combinator::Conj, &cat("conj"), &cat("NP")), Some(cat("NP[conj]")));
    assert_eq!(apply(Combinator::Coord, &cat("NP"), &cat("NP[conj]")), Some(cat("NP")));
    assert_eq!(apply(Combinator::Coord, &cat("N"), &cat("NP[conj]")), None);
    assert_eq!(apply(Combinator::RightPunct, &cat("S[dcl]"), &cat(".")), Some(cat("S[dcl]")));
    assert_eq!(apply(Combinator::LeftPunct, &cat(","), &cat(",")), None);
  }

  #[test]
  fn test_raising() {
    let raised = raise(&cat("NP"), &cat("S"), Slash::Forward);
    assert_eq!(raised, cat("S/(S\\NP)"));
    assert!(is_raised(&raised));
    assert!(!is_raised(&cat("(S\\NP)/(S\\NP)")));
  }

  fn small_grammar() -> Grammar {
    let mut b = Grammar::builder();
    for c in ["NP/N", "N", "S\\NP", "(S\\NP)/NP"] {
      b.lexical(c).unwrap();
    }
    b.category("NP").unwrap();
    b.start("S").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp]);
    b.build().unwrap()
  }

  #[test]
  fn test_codebook() {
    let g = small_grammar();
    let np_n = g.cat_id("NP/N").unwrap();
    let n = g.cat_id("N").unwrap();
    let np = g.cat_id("(NP)").unwrap();
    let rules = g.binary_rules(np_n, n);
    assert_eq!(rules.len(), 1);
    assert_eq!(g.combine(rules[0], np_n, n), Some(np));
    assert_eq!(g.combine(rules[0], n, np_n), None);
    assert!(g.rules_for(np_n, Side::Left).contains(&rules[0]));
    // the determiner takes its head from the noun
    assert_eq!(g.rule(rules[0]).unwrap().rule_type, RuleType::RightBinary);
    assert!(g.is_start(g.cat_id("S").unwrap()));
    assert!(matches!(g.require_cat("PP"), Err(Error::UnknownCategory(_))));
  }

  #[test]
  fn test_instances_are_distinct() {
    let a = small_grammar();
    let b = small_grammar();
    assert_ne!(a.id(), b.id());
    assert!(a.check(a.id()).is_ok());
    assert!(matches!(a.check(b.id()), Err(Error::GrammarMismatch { .. })));
  }

  #[test]
  fn test_licenses() {
    let g = small_grammar();
    let good = Sentence::new(vec![
      Token::new("dogs", "NNS").with_gold("N"),
      Token::new("run", "VBP").with_gold("S\\NP"),
    ]);
    let bad = Sentence::new(vec![Token::new("dogs", "NNS").with_gold("PP")]);
    assert!(g.licenses(&good));
    assert!(!g.licenses(&bad));
  }

  #[test]
  fn test_save_load_roundtrip() {
    let g = small_grammar();
    let dir = tempfile::tempdir().unwrap();
    g.save(dir.path()).unwrap();
    let loaded = Grammar::load(dir.path()).unwrap();

    assert_ne!(loaded.id(), g.id());
    assert_eq!(loaded.num_categories(), g.num_categories());
    for id in 0..g.num_categories() as CatId {
      assert_eq!(loaded.category(id), g.category(id));
      assert_eq!(loaded.is_lexical(id), g.is_lexical(id));
    }
    assert_eq!(loaded.rules(), g.rules());
    let np_n = g.cat_id("NP/N").unwrap();
    assert_eq!(loaded.markup(np_n), g.markup(np_n));
  }

  #[test]
  fn test_load_rejects_unknown_category_in_markup() {
    let g = small_grammar();
    let dir = tempfile::tempdir().unwrap();
    g.save(dir.path()).unwrap();
    fs::write(dir.path().join("markedup"), "PP/NP\t1\t-\n").unwrap();
    assert!(matches!(Grammar::load(dir.path()), Err(Error::UnknownCategory(_))));
  }

  #[test]
  fn test_pruned_grammar() {
    let tree: AutoNode = "(<T S 0 2> (<T NP 1 2> (<L NP/N DT DT the NP/N>) (<L N NN NN dog N>) ) (<L S\\NP VBZ VBZ runs S\\NP>) )"
      .parse()
      .unwrap();
    let mut b = Grammar::builder();
    b.lexical("(S\\NP)/NP").unwrap();
    b.observe(&tree).unwrap();
    let full = b.build().unwrap();
    b.min_rule_count(1);
    let pruned = b.build().unwrap();
    assert!(pruned.rules().len() < full.rules().len());
    assert!(pruned.rules().iter().all(|r| r.count >= 1 || r.rule_type == RuleType::Lexical || r.rule_type == RuleType::Top));
    let np_n = pruned.cat_id("NP/N").unwrap();
    let n = pruned.cat_id("N").unwrap();
    assert_eq!(pruned.binary_rules(np_n, n).len(), 1);
  }
}
