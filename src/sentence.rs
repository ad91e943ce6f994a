use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
  pub word: String,
  pub pos: String,
  /// Gold lexical category, when the sentence comes from a treebank.
  pub gold: Option<String>,
}

impl Token {
  pub fn new(word: &str, pos: &str) -> Self {
    Self {
      word: word.to_string(),
      pos: pos.to_string(),
      gold: None,
    }
  }

  pub fn with_gold(mut self, cat: &str) -> Self {
    self.gold = Some(cat.to_string());
    self
  }
}

/// An immutable token sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sentence {
  tokens: Vec<Token>,
}

impl Sentence {
  pub fn new(tokens: Vec<Token>) -> Self {
    Self { tokens }
  }

  /// Sentence with placeholder POS tags, mostly useful in tests.
  pub fn from_words(words: &[&str]) -> Self {
    Self::new(words.iter().map(|w| Token::new(w, "UNK")).collect())
  }

  pub fn len(&self) -> usize {
    self.tokens.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tokens.is_empty()
  }

  pub fn tokens(&self) -> &[Token] {
    &self.tokens
  }

  pub fn token(&self, idx: usize) -> &Token {
    &self.tokens[idx]
  }

  pub fn words(&self) -> impl Iterator<Item = &str> {
    self.tokens.iter().map(|t| t.word.as_str())
  }

  pub fn has_gold(&self) -> bool {
    !self.tokens.is_empty() && self.tokens.iter().all(|t| t.gold.is_some())
  }
}

impl fmt::Display for Sentence {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (idx, t) in self.tokens.iter().enumerate() {
      if idx > 0 {
        write!(f, " ")?;
      }
      write!(f, "{}", t.word)?;
    }
    Ok(())
  }
}
