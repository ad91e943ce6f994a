//! Reader for CCGbank AUTO derivations.
//!
//! ```text
//! (<T S[dcl] 1 2> (<T NP 0 2> (<L NP/N DT DT the NP_1/N_1>) (<L N NN NN dog N>) ) (<L S[dcl]\NP VBZ VBZ runs S[dcl]\NP_2>) )
//! ```
//!
//! Internal nodes are `<T category head-index child-count>`, leaves are
//! `<L category pos original-pos word predicate-argument-category>`. A parsed
//! tree does not refer to any grammar; [`AutoNode::resolve`] maps it onto one.

use std::io::BufRead;
use std::str::FromStr;

use tracing::warn;

use crate::category::Category;
use crate::derivation::{Derivation, Step};
use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::parse_grammar::{ParseResult, needed_char, parse_field, skip_whitespace};
use crate::sentence::{Sentence, Token};
use crate::syntree::{Constituent, SynTree, Word};
use crate::utils::Span;

#[derive(Debug, Clone, PartialEq)]
pub struct AutoNode {
  pub cat: Category,
  /// Which child is the head, for internal nodes.
  pub head: usize,
  pub children: Vec<AutoNode>,
  /// Set on leaves only; the gold category is the leaf's category.
  pub token: Option<Token>,
}

impl AutoNode {
  pub fn is_leaf(&self) -> bool {
    self.children.is_empty()
  }

  pub fn leaves(&self) -> Vec<&Token> {
    let mut out = Vec::new();
    self.collect(&mut out);
    out
  }

  fn collect<'a>(&'a self, out: &mut Vec<&'a Token>) {
    if let Some(t) = &self.token {
      out.push(t);
    }
    for c in self.children.iter() {
      c.collect(out);
    }
  }

  /// The sentence under this tree, gold categories included.
  pub fn sentence(&self) -> Sentence {
    Sentence::new(self.leaves().into_iter().cloned().collect())
  }

  /// Maps the tree onto `grammar`'s rules. Fails with
  /// [`Error::UnparseableByGrammar`] if some category or step is not in the
  /// grammar, or the root is not a start category.
  pub fn resolve(&self, grammar: &Grammar) -> Result<Derivation> {
    let mut next = 0;
    let tree = self.resolve_node(grammar, &mut next)?;
    let root = match &tree {
      SynTree::Branch(c, _) => c.value.cat,
      SynTree::Leaf(w) => w.value.cat,
    };
    if grammar.top_rule(root).is_none() {
      return Err(Error::UnparseableByGrammar(format!(
        "{} is not a start category",
        grammar.cat_str(root)
      )));
    }
    Ok(tree)
  }

  fn resolve_node(&self, grammar: &Grammar, next: &mut usize) -> Result<Derivation> {
    let unlicensed = |what: String| Error::UnparseableByGrammar(what);
    let cat = grammar
      .cat_id_of(&self.cat)
      .ok_or_else(|| unlicensed(format!("unknown category {}", self.cat)))?;

    match self.children.as_slice() {
      [] => {
        let rule = grammar
          .lexical_rule(cat)
          .ok_or_else(|| unlicensed(format!("{} is not a lexical category", self.cat)))?;
        let span = Span::new(*next, *next + 1);
        *next += 1;
        Ok(SynTree::Leaf(Word {
          value: Step { cat, rule },
          span,
        }))
      }
      [child] => {
        let child = child.resolve_node(grammar, next)?;
        let child_cat = step_of(&child).cat;
        let rule = grammar
          .unary_rules(child_cat)
          .iter()
          .copied()
          .find(|r| grammar.rule(*r).is_some_and(|r| r.result == cat))
          .ok_or_else(|| {
            unlicensed(format!(
              "no unary rule {} => {}",
              grammar.cat_str(child_cat),
              self.cat
            ))
          })?;
        let span = child.span();
        Ok(SynTree::Branch(
          Constituent {
            value: Step { cat, rule },
            span,
          },
          vec![child],
        ))
      }
      [left, right] => {
        let left = left.resolve_node(grammar, next)?;
        let right = right.resolve_node(grammar, next)?;
        let (l, r) = (step_of(&left).cat, step_of(&right).cat);
        let rule = grammar
          .binary_rules(l, r)
          .iter()
          .copied()
          .find(|id| grammar.rule(*id).is_some_and(|rule| rule.result == cat))
          .ok_or_else(|| {
            unlicensed(format!(
              "no binary rule {} {} => {}",
              grammar.cat_str(l),
              grammar.cat_str(r),
              self.cat
            ))
          })?;
        let span = left.span().join(right.span());
        Ok(SynTree::Branch(
          Constituent {
            value: Step { cat, rule },
            span,
          },
          vec![left, right],
        ))
      }
      _ => Err(unlicensed(format!(
        "{} has {} children",
        self.cat,
        self.children.len()
      ))),
    }
  }
}

fn step_of(tree: &Derivation) -> Step {
  match tree {
    SynTree::Branch(c, _) => c.value,
    SynTree::Leaf(w) => w.value,
  }
}

fn parse_node(s: &str) -> ParseResult<'_, AutoNode> {
  let (_, s) = needed_char('(', skip_whitespace(s))?;
  let (_, s) = needed_char('<', skip_whitespace(s))?;
  let (kind, s) = parse_field(s)?;
  match kind {
    "L" => {
      let (cat, s) = parse_field(s)?;
      let (pos, s) = parse_field(s)?;
      let (_, s) = parse_field(s)?;
      let (word, s) = parse_field(s)?;
      let (_, s) = parse_field(s)?;
      let (_, s) = needed_char('>', skip_whitespace(s))?;
      let (_, s) = needed_char(')', skip_whitespace(s))?;
      let node = AutoNode {
        cat: cat.parse()?,
        head: 0,
        children: Vec::new(),
        token: Some(Token::new(word, pos).with_gold(cat)),
      };
      Ok((node, s))
    }
    "T" => {
      let (cat, s) = parse_field(s)?;
      let (head, s) = parse_field(s)?;
      let (count, s) = parse_field(s)?;
      let (_, mut s) = needed_char('>', skip_whitespace(s))?;
      let head = head
        .parse::<usize>()
        .map_err(|e| Error::MalformedGrammar(format!("head index {}: {}", head, e)))?;
      let count = count
        .parse::<usize>()
        .map_err(|e| Error::MalformedGrammar(format!("child count {}: {}", count, e)))?;

      let mut children = Vec::with_capacity(count);
      while !skip_whitespace(s).starts_with(')') {
        let (child, rest) = parse_node(s)?;
        children.push(child);
        s = rest;
      }
      let (_, s) = needed_char(')', skip_whitespace(s))?;
      if children.len() != count || count == 0 {
        return Err(Error::MalformedGrammar(format!(
          "node {} declares {} children, has {}",
          cat,
          count,
          children.len()
        )));
      }
      let node = AutoNode {
        cat: cat.parse()?,
        head,
        children,
        token: None,
      };
      Ok((node, s))
    }
    other => Err(Error::MalformedGrammar(format!("unknown AUTO node type {}", other))),
  }
}

impl FromStr for AutoNode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let (node, rest) = parse_node(s)?;
    if !skip_whitespace(rest).is_empty() {
      return Err(Error::MalformedGrammar(format!("trailing input after derivation: {}", rest)));
    }
    Ok(node)
  }
}

/// Reads one derivation per line, skipping `ID=` header lines and blank
/// lines. Lines that do not parse are logged and skipped.
pub fn read_auto(reader: impl BufRead) -> Result<Vec<AutoNode>> {
  let mut out = Vec::new();
  for (i, line) in reader.lines().enumerate() {
    let line = line?;
    let line = line.trim();
    if line.is_empty() || line.starts_with("ID=") {
      continue;
    }
    match line.parse::<AutoNode>() {
      Ok(tree) => out.push(tree),
      Err(e) => warn!(line = i + 1, %e, "skipping malformed derivation"),
    }
  }
  Ok(out)
}
