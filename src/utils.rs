/// Log-space arithmetic. All scores in the crate are natural-log values.
pub mod log {
  /// Score of an admissible but impossible expansion.
  pub const ZERO: f64 = f64::NEG_INFINITY;
  /// Score of a certain event.
  pub const ONE: f64 = 0.0;

  pub fn is_zero(x: f64) -> bool {
    x == ZERO
  }

  /// Converts a probability to log space, mapping 0 to [`ZERO`].
  pub fn from_prob(p: f64) -> f64 {
    if p <= 0.0 { ZERO } else { p.ln() }
  }

  /// Combines independent log-probabilities. ZERO absorbs everything.
  pub fn mul(a: f64, b: f64) -> f64 {
    if is_zero(a) || is_zero(b) { ZERO } else { a + b }
  }
}

/// Score type used throughout the chart: a natural-log value.
pub type Score = f64;

/// Half-open span `[start, end)` over a sentence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
  pub start: usize,
  pub end: usize,
}

impl Span {
  pub fn new(start: usize, end: usize) -> Self {
    debug_assert!(start < end, "empty span {}..{}", start, end);
    Self { start, end }
  }

  pub fn len(&self) -> usize {
    self.end - self.start
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn join(self, other: Span) -> Span {
    Span::new(self.start, other.end)
  }
}

impl std::fmt::Display for Span {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}..{}", self.start, self.end)
  }
}

/// Interns strings into dense `u32` symbols.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Symbols {
  strings: Vec<Box<str>>,
  ids: hashbrown::HashMap<Box<str>, u32>,
}

impl Symbols {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn len(&self) -> usize {
    self.strings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.strings.is_empty()
  }

  pub fn get(&self, s: &str) -> Option<u32> {
    self.ids.get(s).copied()
  }

  pub fn intern(&mut self, s: &str) -> u32 {
    if let Some(id) = self.ids.get(s) {
      return *id;
    }
    let id = self.strings.len() as u32;
    self.strings.push(s.into());
    self.ids.insert(s.into(), id);
    id
  }

  pub fn resolve(&self, id: u32) -> Option<&str> {
    self.strings.get(id as usize).map(|s| &**s)
  }
}

/// Where symbols come from during feature or event extraction: a read-only
/// lookup at inference time, or an interning table while training.
pub trait SymbolSource {
  fn symbol(&mut self, s: &str) -> Option<u32>;
}

/// Read-only view; unknown strings yield `None`.
pub struct Lookup<'a>(pub &'a Symbols);

impl SymbolSource for Lookup<'_> {
  fn symbol(&mut self, s: &str) -> Option<u32> {
    self.0.get(s)
  }
}

impl SymbolSource for Symbols {
  fn symbol(&mut self, s: &str) -> Option<u32> {
    Some(self.intern(s))
  }
}
