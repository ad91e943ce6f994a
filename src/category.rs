use std::fmt;

/// Direction of a functor's argument.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Slash {
  /// `X/Y`: the argument is to the right.
  Forward,
  /// `X\Y`: the argument is to the left.
  Backward,
}

impl Slash {
  pub fn as_char(self) -> char {
    match self {
      Self::Forward => '/',
      Self::Backward => '\\',
    }
  }
}

/// A CCG category.
///
/// Atoms carry an optional CCGbank feature (`S[dcl]`, `NP[nb]`). A featureless
/// `S` in a functor behaves as a feature variable when the functor combines, so
/// `S\S` applied to `S[dcl]` yields `S[dcl]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
  Atom {
    base: String,
    feature: Option<String>,
  },
  Functor {
    result: Box<Category>,
    slash: Slash,
    arg: Box<Category>,
  },
  /// Left conjunct already absorbed a conjunction: `X[conj]`.
  Conj(Box<Category>),
}

pub const PUNCTUATION: &[&str] = &[",", ".", ";", ":", "LRB", "RRB", "LQU", "RQU"];

/// The feature bound to featureless `S` atoms while matching.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Binding(Option<String>);

impl Binding {
  fn bind(&mut self, feature: &str) -> bool {
    match &self.0 {
      Some(f) => f == feature,
      None => {
        self.0 = Some(feature.to_string());
        true
      }
    }
  }
}

impl Category {
  pub fn atom(base: &str) -> Self {
    Self::Atom {
      base: base.to_string(),
      feature: None,
    }
  }

  pub fn featured(base: &str, feature: &str) -> Self {
    Self::Atom {
      base: base.to_string(),
      feature: Some(feature.to_string()),
    }
  }

  pub fn functor(result: Category, slash: Slash, arg: Category) -> Self {
    Self::Functor {
      result: Box::new(result),
      slash,
      arg: Box::new(arg),
    }
  }

  pub fn conj(self) -> Self {
    Self::Conj(Box::new(self))
  }

  pub fn is_atom(&self) -> bool {
    matches!(self, Self::Atom { .. })
  }

  pub fn is_functor(&self) -> bool {
    matches!(self, Self::Functor { .. })
  }

  pub fn is_conj(&self) -> bool {
    matches!(self, Self::Conj(_))
  }

  pub fn base(&self) -> Option<&str> {
    match self {
      Self::Atom { base, .. } => Some(base),
      _ => None,
    }
  }

  /// `(result, slash, arg)` if this is a functor.
  pub fn split(&self) -> Option<(&Category, Slash, &Category)> {
    match self {
      Self::Functor { result, slash, arg } => Some((result, *slash, arg)),
      _ => None,
    }
  }

  /// Punctuation atoms can be absorbed by their neighbours.
  pub fn is_punct(&self) -> bool {
    match self {
      Self::Atom { base, feature: None } => PUNCTUATION.contains(&base.as_str()),
      _ => false,
    }
  }

  /// Categories that can start a coordination (`conj`, and list commas/semicolons).
  pub fn is_conjunction(&self) -> bool {
    match self {
      Self::Atom { base, feature: None } => matches!(base.as_str(), "conj" | "," | ";"),
      _ => false,
    }
  }

  /// Number of arguments this category still takes.
  pub fn arity(&self) -> usize {
    match self {
      Self::Functor { result, .. } => 1 + result.arity(),
      _ => 0,
    }
  }

  /// Argument slot number of the `idx`-th outermost argument. Slots count from
  /// the innermost argument, so the subject of `(S\NP)/NP` is slot 1.
  pub fn slot_of(&self, idx: usize) -> usize {
    self.arity() - idx
  }

  /// `X|X`: result and argument are the same category.
  pub fn is_modifier(&self) -> bool {
    match self {
      Self::Functor { result, arg, .. } => result == arg,
      _ => false,
    }
  }

  /// Matches `self` as a pattern against `actual`, returning the feature
  /// binding on success.
  pub fn matches(&self, actual: &Category) -> Option<Binding> {
    let mut binding = Binding::default();
    if Self::unify_into(self, actual, &mut binding) {
      Some(binding)
    } else {
      None
    }
  }

  fn unify_into(pattern: &Category, actual: &Category, binding: &mut Binding) -> bool {
    match (pattern, actual) {
      (
        Self::Atom {
          base: b1,
          feature: f1,
        },
        Self::Atom {
          base: b2,
          feature: f2,
        },
      ) => {
        if b1 != b2 {
          return false;
        }
        match (f1, f2) {
          (Some(a), Some(b)) => a == b,
          (None, Some(b)) if b1 == "S" => binding.bind(b),
          _ => true,
        }
      }
      (
        Self::Functor {
          result: r1,
          slash: s1,
          arg: a1,
        },
        Self::Functor {
          result: r2,
          slash: s2,
          arg: a2,
        },
      ) => s1 == s2 && Self::unify_into(r1, r2, binding) && Self::unify_into(a1, a2, binding),
      (Self::Conj(a), Self::Conj(b)) => Self::unify_into(a, b, binding),
      _ => false,
    }
  }

  /// Fills featureless `S` atoms with the bound feature.
  pub fn substitute(&self, binding: &Binding) -> Category {
    match (self, &binding.0) {
      (Self::Atom { base, feature: None }, Some(f)) if base == "S" => Self::featured(base, f),
      (Self::Atom { .. }, _) => self.clone(),
      (Self::Functor { result, slash, arg }, _) => {
        Self::functor(result.substitute(binding), *slash, arg.substitute(binding))
      }
      (Self::Conj(inner), _) => inner.substitute(binding).conj(),
    }
  }

  fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_functor() {
      write!(f, "({})", self)
    } else {
      write!(f, "{}", self)
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Atom { base, feature } => {
        write!(f, "{}", base)?;
        if let Some(feature) = feature {
          write!(f, "[{}]", feature)?;
        }
        Ok(())
      }
      Self::Functor { result, slash, arg } => {
        result.fmt_nested(f)?;
        write!(f, "{}", slash.as_char())?;
        arg.fmt_nested(f)
      }
      Self::Conj(inner) => {
        inner.fmt_nested(f)?;
        write!(f, "[conj]")
      }
    }
  }
}
