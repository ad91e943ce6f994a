//! Predicate-argument dependencies decoded from derivations.
//!
//! Every lexical functor starts with one owner per argument slot (minus the
//! slots its markup silences). Combination passes the owners along: when an
//! argument is filled, each owner of that argument yields a dependency on
//! every head word of the filler.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::derivation::Derivation;
use crate::grammar::Grammar;
use crate::rules::{CatId, Combinator, Rule, Side};
use crate::sentence::Sentence;
use crate::syntree::SynTree;

/// `target` is the predicate token, `source` the head of its `slot`-th argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
  pub target: usize,
  pub source: usize,
  pub cat: CatId,
  pub slot: usize,
}

impl Dependency {
  /// Same category, slot and direction.
  pub fn matches_labeled(&self, other: &Dependency) -> bool {
    self == other
  }

  /// Same pair of words, in either direction.
  pub fn matches_unlabeled(&self, other: &Dependency) -> bool {
    self.pair() == other.pair()
  }

  fn pair(&self) -> (usize, usize) {
    (self.target.min(self.source), self.target.max(self.source))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepSet(BTreeSet<Dependency>);

impl DepSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, dep: Dependency) -> bool {
    self.0.insert(dep)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn contains(&self, dep: &Dependency) -> bool {
    self.0.contains(dep)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
    self.0.iter()
  }

  pub fn labeled_matches(&self, other: &DepSet) -> usize {
    self.0.intersection(&other.0).count()
  }

  /// Word pairs present in both sets, ignoring labels and direction.
  pub fn unlabeled_matches(&self, other: &DepSet) -> usize {
    let ours = self.pairs();
    let theirs = other.pairs();
    ours.intersection(&theirs).count()
  }

  /// Distinct unordered word pairs.
  pub fn pairs(&self) -> BTreeSet<(usize, usize)> {
    self.0.iter().map(|d| d.pair()).collect()
  }

  /// One dependency per line: `pred_i category slot arg_j`.
  pub fn render(&self, grammar: &Grammar, sentence: &Sentence) -> String {
    let mut out = String::new();
    for d in self.0.iter() {
      let _ = writeln!(
        out,
        "{}_{} {} {} {}_{}",
        sentence.token(d.target).word,
        d.target,
        grammar.cat_str(d.cat),
        d.slot,
        sentence.token(d.source).word,
        d.source
      );
    }
    out
  }
}

impl FromIterator<Dependency> for DepSet {
  fn from_iter<I: IntoIterator<Item = Dependency>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

#[derive(Debug, Clone, Copy)]
struct Owner {
  pred: usize,
  cat: CatId,
  slot: usize,
}

#[derive(Debug, Clone)]
enum Head {
  Words(Vec<usize>),
  /// Not known until the argument at this (outermost-first) index is filled.
  Arg(usize),
}

#[derive(Debug, Clone)]
struct Sem {
  head: Head,
  /// Owners per remaining argument, outermost first.
  args: Vec<Vec<Owner>>,
  /// Built by type-raising: when it combines, the other side does the consuming.
  raised: bool,
}

impl Sem {
  fn empty(arity: usize) -> Self {
    Self {
      head: Head::Words(Vec::new()),
      args: vec![Vec::new(); arity],
      raised: false,
    }
  }

  fn resized(mut self, arity: usize) -> Self {
    if self.args.len() != arity {
      self.args = vec![Vec::new(); arity];
      if let Head::Arg(_) = self.head {
        self.head = Head::Words(Vec::new());
      }
    }
    self.raised = false;
    self
  }
}

/// Decodes the dependencies of `tree`.
pub fn dependencies(grammar: &Grammar, tree: &Derivation) -> DepSet {
  let mut out = DepSet::new();
  decode(grammar, tree, &mut out);
  out
}

fn decode(grammar: &Grammar, tree: &Derivation, out: &mut DepSet) -> Sem {
  match tree {
    SynTree::Leaf(w) => lexical(grammar, w.value.cat, w.span.start),
    SynTree::Branch(c, children) => {
      let arity = grammar.category(c.value.cat).arity();
      let Some(rule) = grammar.rule(c.value.rule) else {
        return Sem::empty(arity);
      };
      match children.as_slice() {
        [child] => {
          let child = decode(grammar, child, out);
          unary(rule, child, arity)
        }
        [left, right] => {
          let left = decode(grammar, left, out);
          let right = decode(grammar, right, out);
          binary(rule, left, right, arity, out)
        }
        _ => Sem::empty(arity),
      }
    }
  }
}

fn lexical(grammar: &Grammar, cat: CatId, word: usize) -> Sem {
  let category = grammar.category(cat);
  let markup = grammar.markup(cat);
  let arity = category.arity();
  let args = (0..arity)
    .map(|idx| {
      let slot = category.slot_of(idx);
      if markup.is_silent(slot) {
        Vec::new()
      } else {
        vec![Owner {
          pred: word,
          cat,
          slot,
        }]
      }
    })
    .collect();
  let head = match markup.head_slot {
    Some(slot) if slot >= 1 && slot <= arity => Head::Arg(arity - slot),
    _ => Head::Words(vec![word]),
  };
  Sem {
    head,
    args,
    raised: false,
  }
}

fn unary(rule: &Rule, child: Sem, arity: usize) -> Sem {
  match rule.combinator {
    Combinator::FwdRaise | Combinator::BwdRaise => Sem {
      head: match child.head {
        Head::Words(w) => Head::Words(w),
        Head::Arg(_) => Head::Words(Vec::new()),
      },
      args: vec![Vec::new(); arity],
      raised: true,
    },
    _ => child.resized(arity),
  }
}

fn binary(rule: &Rule, left: Sem, right: Sem, arity: usize, out: &mut DepSet) -> Sem {
  match rule.combinator {
    Combinator::FwdApp => apply(left, right, out),
    Combinator::BwdApp => apply(right, left, out),
    Combinator::FwdComp => compose(left, right, out),
    Combinator::BwdComp | Combinator::BwdCrossComp => compose(right, left, out),
    Combinator::Conj | Combinator::LeftPunct => right,
    Combinator::RightPunct => left,
    Combinator::Coord => coordinate(left, right),
    _ => match rule.head_side() {
      Some(Side::Right) => right.resized(arity),
      _ => left.resized(arity),
    },
  }
}

fn fill(owners: &[Owner], head: &Head, out: &mut DepSet) {
  if let Head::Words(words) = head {
    for o in owners {
      for w in words {
        if *w != o.pred {
          out.insert(Dependency {
            target: o.pred,
            source: *w,
            cat: o.cat,
            slot: o.slot,
          });
        }
      }
    }
  }
}

/// Positionwise union, when the argument structures line up.
fn merge(into: &mut [Vec<Owner>], from: Vec<Vec<Owner>>) {
  if into.len() == from.len() {
    for (a, b) in into.iter_mut().zip(from) {
      a.extend(b);
    }
  }
}

fn take_first(args: &mut Vec<Vec<Owner>>) -> Vec<Owner> {
  if args.is_empty() {
    Vec::new()
  } else {
    args.remove(0)
  }
}

/// `functor` consumes `arg`.
fn apply(functor: Sem, arg: Sem, out: &mut DepSet) -> Sem {
  if functor.raised {
    return consume(arg, functor, 0, out);
  }
  let mut args = functor.args;
  let first = take_first(&mut args);
  fill(&first, &arg.head, out);
  let head = match functor.head {
    Head::Arg(0) => arg.head,
    Head::Arg(k) => Head::Arg(k - 1),
    words => words,
  };
  merge(&mut args, arg.args);
  Sem {
    head,
    args,
    raised: false,
  }
}

/// `primary` (`X|Y`) composes with `secondary` (`Y|Z`) into `X|Z`.
fn compose(primary: Sem, secondary: Sem, out: &mut DepSet) -> Sem {
  if primary.raised {
    return consume(secondary, primary, 1, out);
  }
  let mut fargs = primary.args;
  let first = take_first(&mut fargs);
  fill(&first, &secondary.head, out);
  let mut gargs = secondary.args;
  let z = take_first(&mut gargs);
  let head = match primary.head {
    Head::Arg(0) => match secondary.head {
      Head::Arg(0) => Head::Arg(0),
      Head::Arg(_) => Head::Words(Vec::new()),
      words => words,
    },
    other => other,
  };
  merge(&mut fargs, gargs);
  let mut args = Vec::with_capacity(fargs.len() + 1);
  args.push(z);
  args.extend(fargs);
  Sem {
    head,
    args,
    raised: false,
  }
}

/// `functor` fills its argument at `idx` with the word(s) under a type-raised category.
fn consume(functor: Sem, raised: Sem, idx: usize, out: &mut DepSet) -> Sem {
  let mut args = functor.args;
  let owners = if idx < args.len() {
    args.remove(idx)
  } else {
    Vec::new()
  };
  fill(&owners, &raised.head, out);
  let head = match functor.head {
    Head::Arg(k) if k == idx => raised.head,
    Head::Arg(k) if k > idx => Head::Arg(k - 1),
    other => other,
  };
  Sem {
    head,
    args,
    raised: false,
  }
}

fn coordinate(left: Sem, right: Sem) -> Sem {
  let head = match (left.head, right.head) {
    (Head::Words(mut a), Head::Words(b)) => {
      a.extend(b);
      Head::Words(a)
    }
    (Head::Arg(k), _) => Head::Arg(k),
    (words, _) => words,
  };
  let mut args = left.args;
  merge(&mut args, right.args);
  Sem {
    head,
    args,
    raised: false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::syntree::{Constituent, Word};
  use crate::utils::Span;

  use crate::chart::Retain;
  use crate::config::ParserConfig;
  use crate::derivation::Step;
  use crate::multitag::Multitags;
  use crate::parser::Parser;
  use crate::sentence::Token;
  use crate::test_utils::*;

  fn leaf(g: &Grammar, cat: &str, i: usize) -> Derivation {
    let cat = g.cat_id(cat).unwrap();
    SynTree::Leaf(Word {
      value: Step {
        cat,
        rule: g.lexical_rule(cat).unwrap(),
      },
      span: Span::new(i, i + 1),
    })
  }

  fn branch(g: &Grammar, cat: &str, comb: Combinator, children: Vec<Derivation>) -> Derivation {
    let cat = g.cat_id(cat).unwrap();
    let rule = g
      .rules()
      .iter()
      .find(|r| r.result == cat && r.combinator == comb)
      .unwrap()
      .id;
    let span = children[0].span().join(children[children.len() - 1].span());
    SynTree::Branch(Constituent { value: Step { cat, rule }, span }, children)
  }

  #[test]
  fn test_subject_dependency() {
    let g = toy_grammar();
    let np = branch(
      &g,
      "NP",
      Combinator::FwdApp,
      vec![leaf(&g, "NP/N", 0), leaf(&g, "N", 1)],
    );
    let s = branch(&g, "S", Combinator::BwdApp, vec![np, leaf(&g, "S\\NP", 2)]);
    let deps = dependencies(&g, &s);
    let expected = Dependency {
      target: 2,
      source: 1,
      cat: g.cat_id("S\\NP").unwrap(),
      slot: 1,
    };
    assert_eq!(deps.iter().copied().collect::<Vec<_>>(), vec![expected]);
  }

  #[test]
  fn test_modifier_passes_subject_through() {
    let g = ambiguous_grammar();
    // ducks saw ducks today, with "today" modifying the verb phrase
    let vp = branch(
      &g,
      "S\\NP",
      Combinator::FwdApp,
      vec![leaf(&g, "(S\\NP)/NP", 1), leaf(&g, "NP", 2)],
    );
    let vp = branch(
      &g,
      "S\\NP",
      Combinator::BwdApp,
      vec![vp, leaf(&g, "(S\\NP)\\(S\\NP)", 3)],
    );
    let s = branch(&g, "S", Combinator::BwdApp, vec![leaf(&g, "NP", 0), vp]);
    let deps = dependencies(&g, &s);
    let tv = g.cat_id("(S\\NP)/NP").unwrap();
    let adv = g.cat_id("(S\\NP)\\(S\\NP)").unwrap();
    let got = deps
      .iter()
      .map(|d| (d.target, d.source, d.cat, d.slot))
      .collect::<Vec<_>>();
    assert_eq!(got, vec![(1, 0, tv, 1), (1, 2, tv, 2), (3, 1, adv, 2)]);
  }

  fn labeled(g: &Grammar, deps: &DepSet) -> Vec<(usize, String, usize, usize)> {
    deps
      .iter()
      .map(|d| (d.target, g.cat_str(d.cat), d.slot, d.source))
      .collect()
  }

  #[test]
  fn test_object_extraction_through_raising() {
    let mut b = Grammar::builder();
    for c in ["NP", "(NP\\NP)/(S/NP)", "(S\\NP)/NP"] {
      b.lexical(c).unwrap();
    }
    b.category("S/NP").unwrap();
    b.category("NP\\NP").unwrap();
    b.start("NP").unwrap();
    b.type_raise("NP", "S").unwrap();
    b.combinators(&[Combinator::FwdApp, Combinator::BwdApp, Combinator::FwdComp]);
    let g = b.build().unwrap();

    let s = Sentence::new(vec![
      Token::new("dogs", "NNS"),
      Token::new("that", "WDT"),
      Token::new("I", "PRP"),
      Token::new("saw", "VBD"),
    ]);
    let tags = Multitags::from_strs(
      &g,
      &[
        &[("NP", 1.0)],
        &[("(NP\\NP)/(S/NP)", 1.0)],
        &[("NP", 1.0)],
        &[("(S\\NP)/NP", 1.0)],
      ],
    )
    .unwrap();
    let model = FixedModel::new(&g);
    let parser = Parser::new(&g, &model, ParserConfig::new().retain(Retain::All)).unwrap();
    let parses = parser.k_best(&s, &tags, 10).unwrap();
    assert_eq!(parses.len(), 1);

    // "I saw" is S/NP: the raised subject composes with the verb
    let rules = g.rules();
    let mut used = Vec::new();
    let mut stack = vec![&parses[0].tree];
    while let Some(node) = stack.pop() {
      if let SynTree::Branch(c, children) = node {
        used.push(rules[c.value.rule as usize].combinator);
        stack.extend(children.iter());
      }
    }
    assert!(used.contains(&Combinator::FwdRaise));
    assert!(used.contains(&Combinator::FwdComp));

    let deps = dependencies(&g, &parses[0].tree);
    let tv = "(S\\NP)/NP".to_string();
    let rel = "(NP\\NP)/(S/NP)".to_string();
    assert_eq!(
      labeled(&g, &deps),
      vec![(1, rel.clone(), 1, 0), (1, rel, 2, 3), (3, tv.clone(), 2, 0), (3, tv, 1, 2)]
    );
    assert_eq!(
      deps.render(&g, &s),
      "that_1 (NP\\NP)/(S/NP) 1 dogs_0\n\
       that_1 (NP\\NP)/(S/NP) 2 saw_3\n\
       saw_3 (S\\NP)/NP 2 dogs_0\n\
       saw_3 (S\\NP)/NP 1 I_2\n"
    );
  }

  #[test]
  fn test_coordinated_subjects() {
    let mut b = Grammar::builder();
    for c in ["NP", "conj", "S\\NP"] {
      b.lexical(c).unwrap();
    }
    b.category("NP[conj]").unwrap();
    b.start("S").unwrap();
    b.combinators(&[
      Combinator::FwdApp,
      Combinator::BwdApp,
      Combinator::Conj,
      Combinator::Coord,
    ]);
    let g = b.build().unwrap();

    let s = Sentence::new(vec![
      Token::new("dogs", "NNS"),
      Token::new("and", "CC"),
      Token::new("cats", "NNS"),
      Token::new("run", "VBP"),
    ]);
    let tags = Multitags::from_strs(
      &g,
      &[&[("NP", 1.0)], &[("conj", 1.0)], &[("NP", 1.0)], &[("S\\NP", 1.0)]],
    )
    .unwrap();
    let model = FixedModel::new(&g);
    let parser = Parser::new(&g, &model, ParserConfig::new()).unwrap();
    let tree = parser.parse(&s, &tags).unwrap().tree;

    // both conjuncts fill the verb's subject slot
    let deps = dependencies(&g, &tree);
    let iv = "S\\NP".to_string();
    assert_eq!(labeled(&g, &deps), vec![(3, iv.clone(), 1, 0), (3, iv, 1, 2)]);
  }

  #[test]
  fn test_match_predicates() {
    let a = Dependency {
      target: 2,
      source: 1,
      cat: 5,
      slot: 1,
    };
    let b = Dependency {
      target: 1,
      source: 2,
      cat: 7,
      slot: 2,
    };
    assert!(a.matches_unlabeled(&b));
    assert_eq!(a.matches_unlabeled(&b), b.matches_unlabeled(&a));
    assert!(!a.matches_labeled(&b));
    assert!(a.matches_labeled(&a));

    let x: DepSet = [a].into_iter().collect();
    let y: DepSet = [b].into_iter().collect();
    assert_eq!(x.unlabeled_matches(&y), 1);
    assert_eq!(y.unlabeled_matches(&x), 1);
    assert_eq!(x.labeled_matches(&y), 0);
  }
}
