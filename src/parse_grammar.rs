use regex::Regex;
/// Simple recursive-descent parsing of category strings and AUTO derivations
use std::str::FromStr;

use crate::category::{Category, Slash};
use crate::errors::Error;

impl FromStr for Category {
  type Err = Error;

  /// Parses a CCGbank category string such as `(S[dcl]\NP)/NP`.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (cat, rest) = parse_category(s.trim())?;
    if !rest.is_empty() {
      return Err(Error::MalformedGrammar(format!(
        "trailing input after category {}: {}",
        cat, rest
      )));
    }
    Ok(cat)
  }
}

pub(crate) type Infallible<'a, T> = (T, &'a str);
pub(crate) type ParseResult<'a, T> = Result<(T, &'a str), Error>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

fn malformed(msg: String) -> Error {
  Error::MalformedGrammar(msg)
}

/// Try to consume a regex, returning None if it doesn't match
pub(crate) fn optional_re<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, Option<&'a str>> {
  if let Some(m) = re.find(s) {
    if m.start() > 0 {
      return (None, s);
    }
    let (_, rest) = s.split_at(m.end());
    (Some(m.as_str()), rest)
  } else {
    (None, s)
  }
}

/// Try to consume a regex, failing if it doesn't match
pub(crate) fn needed_re<'a>(re: &'static Regex, s: &'a str) -> ParseResult<'a, &'a str> {
  if let (Some(c), rest) = optional_re(re, s) {
    Ok((c, rest))
  } else {
    Err(malformed(format!("couldn't match {} at {}", re, s)))
  }
}

/// Try to consume a char, returning None if it doesn't match
pub(crate) fn optional_char(c: char, s: &str) -> Infallible<'_, Option<char>> {
  match s.strip_prefix(c) {
    Some(rest) => (Some(c), rest),
    None => (None, s),
  }
}

/// Try to consume a char, failing if it doesn't match
pub(crate) fn needed_char(c: char, s: &str) -> ParseResult<'_, char> {
  if let (Some(c), rest) = optional_char(c, s) {
    Ok((c, rest))
  } else {
    Err(malformed(format!("couldn't match {} at {}", c, s)))
  }
}

/// Tries to skip 1 or more \s characters
pub(crate) fn skip_whitespace(s: &str) -> &str {
  s.trim_start()
}

/// Atom base: letters, or one of the punctuation atoms
fn parse_base(s: &str) -> ParseResult<'_, &str> {
  regex_static!(BASE, r"[A-Za-z]+|[,.;:]");
  needed_re(&BASE, s).map_err(|e| malformed(format!("atom: {}", e)))
}

/// Parses an optional [feature]
fn parse_feature(s: &str) -> ParseResult<'_, Option<&str>> {
  regex_static!(FEATURE, r"\[[A-Za-z0-9]+\]");
  match optional_re(&FEATURE, s) {
    (Some(f), rest) => Ok((Some(&f[1..f.len() - 1]), rest)),
    (None, rest) => Ok((None, rest)),
  }
}

/// Any number of trailing [conj] markers
fn parse_conj_suffix(mut cat: Category, s: &str) -> ParseResult<'_, Category> {
  let mut rem = s;
  while let Some(rest) = rem.strip_prefix("[conj]") {
    cat = cat.conj();
    rem = rest;
  }
  Ok((cat, rem))
}

fn parse_primary(s: &str) -> ParseResult<'_, Category> {
  if let (Some(_), rest) = optional_char('(', s) {
    let (inner, rest) = parse_category(rest)?;
    let (_, rest) = needed_char(')', rest)?;
    return parse_conj_suffix(inner, rest);
  }

  let (base, rest) = parse_base(s)?;
  let (feature, rest) = parse_feature(rest)?;
  let atom = match feature {
    // NP[conj] is a conjunct marker, not a feature
    Some("conj") => Category::atom(base).conj(),
    Some(f) => Category::featured(base, f),
    None => Category::atom(base),
  };
  parse_conj_suffix(atom, rest)
}

/// Slash-separated primaries, left associative
pub(crate) fn parse_category(s: &str) -> ParseResult<'_, Category> {
  let (mut cat, mut rem) = parse_primary(s)?;
  loop {
    let slash = match rem.chars().next() {
      Some('/') => Slash::Forward,
      Some('\\') => Slash::Backward,
      _ => return Ok((cat, rem)),
    };
    let (arg, rest) = parse_primary(&rem[1..])?;
    cat = Category::functor(cat, slash, arg);
    rem = rest;
  }
}

/// One whitespace-delimited field (used by the AUTO and grammar file readers)
pub(crate) fn parse_field(s: &str) -> ParseResult<'_, &str> {
  regex_static!(FIELD, r"[^\s<>]+");
  let s = skip_whitespace(s);
  needed_re(&FIELD, s)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_nested() {
    let c: Category = "((S[b]\\NP)/NP)/PP".parse().unwrap();
    assert_eq!(c.arity(), 3);
    assert_eq!(c.to_string(), "((S[b]\\NP)/NP)/PP");
  }

  #[test]
  fn test_parse_punct_and_conj() {
    let c: Category = ",".parse().unwrap();
    assert!(c.is_punct());
    let c: Category = "S[dcl][conj]".parse().unwrap();
    assert_eq!(c, Category::featured("S", "dcl").conj());
  }

  #[test]
  fn test_parse_errors() {
    assert!("(S\\NP".parse::<Category>().is_err());
    assert!("S\\".parse::<Category>().is_err());
    assert!("S NP".parse::<Category>().is_err());
    assert!("".parse::<Category>().is_err());
  }
}
