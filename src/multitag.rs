//! Candidate lexical categories per word, as produced by a supertagger.

use std::io::BufRead;

use tracing::debug;

use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::rules::CatId;
use crate::sentence::{Sentence, Token};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tag {
  pub cat: CatId,
  /// Tagger probability; only ratios to the word's best score matter.
  pub score: f64,
}

/// Per-word candidate lists, each sorted by descending score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Multitags {
  words: Vec<Vec<Tag>>,
}

impl Multitags {
  pub fn new(mut words: Vec<Vec<Tag>>) -> Self {
    for tags in words.iter_mut() {
      // stable, so equal scores keep the tagger's order
      tags.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
    Self { words }
  }

  /// Builds the assignment from category strings. Unknown strings are an error.
  pub fn from_strs(grammar: &Grammar, words: &[&[(&str, f64)]]) -> Result<Self> {
    let mut out = Vec::with_capacity(words.len());
    for tags in words {
      let mut v = Vec::with_capacity(tags.len());
      for (cat, score) in tags.iter() {
        v.push(Tag {
          cat: grammar.require_cat(cat)?,
          score: *score,
        });
      }
      out.push(v);
    }
    Ok(Self::new(out))
  }

  /// A single-candidate assignment taken from the sentence's gold categories.
  pub fn from_gold(grammar: &Grammar, sentence: &Sentence) -> Result<Self> {
    let mut out = Vec::with_capacity(sentence.len());
    for t in sentence.tokens() {
      let gold = t
        .gold
        .as_deref()
        .ok_or_else(|| Error::InvalidArgument(format!("token {} has no gold category", t.word)))?;
      out.push(vec![Tag {
        cat: grammar.require_cat(gold)?,
        score: 1.0,
      }]);
    }
    Ok(Self::new(out))
  }

  pub fn len(&self) -> usize {
    self.words.len()
  }

  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }

  pub fn best(&self, idx: usize) -> Option<&Tag> {
    self.words.get(idx).and_then(|t| t.first())
  }

  pub fn all(&self, idx: usize) -> &[Tag] {
    self.words.get(idx).map(|t| t.as_slice()).unwrap_or(&[])
  }

  /// Candidates scoring at least `beta` times the word's best score.
  pub fn within(&self, idx: usize, beta: f64) -> impl Iterator<Item = &Tag> {
    let cutoff = self.best(idx).map(|t| t.score * beta).unwrap_or(f64::INFINITY);
    self.all(idx).iter().take_while(move |t| t.score >= cutoff)
  }

  /// Merges `other` into this assignment, keeping the higher score on collisions.
  pub fn merge(&mut self, other: &Multitags) {
    for (idx, extra) in other.words.iter().enumerate() {
      if idx >= self.words.len() {
        self.words.push(Vec::new());
      }
      let tags = &mut self.words[idx];
      for tag in extra {
        match tags.iter_mut().find(|t| t.cat == tag.cat) {
          Some(t) => t.score = t.score.max(tag.score),
          None => tags.push(*tag),
        }
      }
      tags.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
  }
}

/// Reads multitagger output: one token per line as
/// `word pos cat score [cat score ...]`, blank line between sentences.
///
/// Categories the grammar does not know are skipped; the tagger's category set
/// is usually larger than the parser's.
pub fn read_multitags(reader: impl BufRead, grammar: &Grammar) -> Result<Vec<(Sentence, Multitags)>> {
  let mut out = Vec::new();
  let mut tokens = Vec::new();
  let mut tags = Vec::new();

  for (lineno, line) in reader.lines().enumerate() {
    let line = line?;
    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.is_empty() {
      if !tokens.is_empty() {
        out.push((
          Sentence::new(std::mem::take(&mut tokens)),
          Multitags::new(std::mem::take(&mut tags)),
        ));
      }
      continue;
    }
    if fields.len() < 2 || fields.len() % 2 != 0 {
      return Err(Error::serialization(
        "<multitags>",
        format!("line {}: expected `word pos (cat score)*`", lineno + 1),
      ));
    }

    let mut word_tags = Vec::new();
    for pair in fields[2..].chunks(2) {
      let score = pair[1].parse::<f64>().map_err(|e| {
        Error::serialization("<multitags>", format!("line {}: {}: {}", lineno + 1, pair[1], e))
      })?;
      match grammar.cat_id(pair[0]) {
        Some(cat) => word_tags.push(Tag { cat, score }),
        None => debug!(line = lineno + 1, cat = pair[0], "skipping category unknown to the grammar"),
      }
    }
    tokens.push(Token::new(fields[0], fields[1]));
    tags.push(word_tags);
  }
  if !tokens.is_empty() {
    out.push((Sentence::new(tokens), Multitags::new(tags)));
  }

  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::toy_grammar;

  #[test]
  fn test_within_beam() {
    let g = toy_grammar();
    let tags = Multitags::from_strs(&g, &[&[("N", 0.05), ("NP/N", 0.9), ("S\\NP", 0.2)]]).unwrap();
    assert_eq!(tags.best(0).unwrap().cat, g.cat_id("NP/N").unwrap());
    assert_eq!(tags.within(0, 0.1).count(), 2);
    assert_eq!(tags.within(0, 0.05).count(), 3);
    assert_eq!(tags.within(1, 0.05).count(), 0);
  }

  #[test]
  fn test_read_multitags() {
    let g = toy_grammar();
    let input = "the DT NP/N 0.9 PP/NP 0.1\ndog NN N 1.0\n\nruns VBZ S\\NP 0.7\n";
    let parsed = read_multitags(input.as_bytes(), &g).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].0.to_string(), "the dog");
    // PP/NP is not in the grammar
    assert_eq!(parsed[0].1.all(0).len(), 1);
    assert_eq!(parsed[1].1.best(0).unwrap().score, 0.7);

    assert!(read_multitags("the DT NP/N\n".as_bytes(), &g).is_err());
  }
}
