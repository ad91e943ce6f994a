use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Dense codebook id of a category. Only meaningful for the grammar that issued it.
pub type CatId = u32;
/// Dense codebook id of a rule. Only meaningful for the grammar that issued it.
pub type RuleId = u32;

/// Which side of a binary rule supplies the head.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
  Left,
  Right,
}

/// Coarse classification of a rule, used as a conditioning marker by the models.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RuleType {
  Lexical,
  /// Binary, head on the left.
  LeftBinary,
  /// Binary, head on the right.
  RightBinary,
  Unary,
  Top,
}

impl RuleType {
  pub fn is_binary(self) -> bool {
    matches!(self, Self::LeftBinary | Self::RightBinary)
  }

  pub fn head_side(self) -> Option<Side> {
    match self {
      Self::LeftBinary => Some(Side::Left),
      Self::RightBinary => Some(Side::Right),
      _ => None,
    }
  }
}

/// The combinatory schema a rule instantiates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Combinator {
  Lexical,
  /// `X/Y Y => X`
  FwdApp,
  /// `Y X\Y => X`
  BwdApp,
  /// `X/Y Y/Z => X/Z`
  FwdComp,
  /// `Y\Z X\Y => X\Z`
  BwdComp,
  /// `Y/Z X\Y => X/Z`
  BwdCrossComp,
  /// `X => T/(T\X)`
  FwdRaise,
  /// `X => T\(T/X)`
  BwdRaise,
  /// `conj X => X[conj]`
  Conj,
  /// `X X[conj] => X`
  Coord,
  /// `, X => X`
  LeftPunct,
  /// `X , => X`
  RightPunct,
  /// Listed unary type-changing rule, e.g. `N => NP`.
  TypeChange,
  /// Binary rule seen in a treebank that no schema explains.
  Observed,
  Top,
}

impl Combinator {
  pub const BINARY: &'static [Combinator] = &[
    Self::FwdApp,
    Self::BwdApp,
    Self::FwdComp,
    Self::BwdComp,
    Self::BwdCrossComp,
    Self::Conj,
    Self::Coord,
    Self::LeftPunct,
    Self::RightPunct,
  ];

  pub fn is_binary(self) -> bool {
    Self::BINARY.contains(&self) || self == Self::Observed
  }

  pub fn is_unary(self) -> bool {
    matches!(self, Self::FwdRaise | Self::BwdRaise | Self::TypeChange)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Lexical => "lex",
      Self::FwdApp => "fa",
      Self::BwdApp => "ba",
      Self::FwdComp => "fc",
      Self::BwdComp => "bc",
      Self::BwdCrossComp => "bx",
      Self::FwdRaise => "ftr",
      Self::BwdRaise => "btr",
      Self::Conj => "conj",
      Self::Coord => "coord",
      Self::LeftPunct => "lp",
      Self::RightPunct => "rp",
      Self::TypeChange => "tc",
      Self::Observed => "obs",
      Self::Top => "top",
    }
  }
}

impl fmt::Display for Combinator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for Combinator {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "lex" => Self::Lexical,
      "fa" => Self::FwdApp,
      "ba" => Self::BwdApp,
      "fc" => Self::FwdComp,
      "bc" => Self::BwdComp,
      "bx" => Self::BwdCrossComp,
      "ftr" => Self::FwdRaise,
      "btr" => Self::BwdRaise,
      "conj" => Self::Conj,
      "coord" => Self::Coord,
      "lp" => Self::LeftPunct,
      "rp" => Self::RightPunct,
      "tc" => Self::TypeChange,
      "obs" => Self::Observed,
      "top" => Self::Top,
      _ => return Err(Error::MalformedGrammar(format!("unknown combinator {}", s))),
    })
  }
}

/// What a rule consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Production {
  /// A word with the rule's result as its lexical category.
  Terminal,
  Unary(CatId),
  Binary(CatId, CatId),
}

/// One rule instance of the codebook: a combinator applied to concrete categories.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
  pub id: RuleId,
  pub rule_type: RuleType,
  pub combinator: Combinator,
  pub result: CatId,
  pub production: Production,
  /// Frequency in the data the grammar was built from; 0 if only enumerated.
  pub count: u32,
}

impl Rule {
  pub fn len(&self) -> usize {
    match self.production {
      Production::Terminal => 0,
      Production::Unary(_) => 1,
      Production::Binary(_, _) => 2,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn children(&self) -> (Option<CatId>, Option<CatId>) {
    match self.production {
      Production::Terminal => (None, None),
      Production::Unary(c) => (Some(c), None),
      Production::Binary(l, r) => (Some(l), Some(r)),
    }
  }

  pub fn head_side(&self) -> Option<Side> {
    self.rule_type.head_side()
  }
}
