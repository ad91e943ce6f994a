//! Parser and trainer settings.
//!
//! Both structs are plain builders: setters take `self` by value, and
//! `validate` is called by whoever consumes the config.

use std::path::PathBuf;

use crate::chart::Retain;
use crate::errors::{Error, Result};
use crate::store::Compression;

pub const DEFAULT_BETAS: &[f64] = &[0.1, 0.05, 0.025, 0.01, 0.005];

#[derive(Debug, Clone, PartialEq)]
pub struct ParserConfig {
  pub betas: Vec<f64>,
  pub max_sentence_len: usize,
  pub retain: Retain,
  /// Fine items more than this factor below their cell's best (by inside score
  /// plus figure of merit) are pruned. `None` disables the beam.
  pub fine_beam: Option<f64>,
  /// Coarse items per chart before the sentence is abandoned.
  pub max_items: usize,
  pub num_threads: usize,
}

impl Default for ParserConfig {
  fn default() -> Self {
    Self {
      betas: DEFAULT_BETAS.to_vec(),
      max_sentence_len: 250,
      retain: Retain::Best,
      fine_beam: None,
      max_items: 1_000_000,
      num_threads: 1,
    }
  }
}

impl ParserConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn betas(mut self, betas: &[f64]) -> Self {
    self.betas = betas.to_vec();
    self
  }

  pub fn max_sentence_len(mut self, n: usize) -> Self {
    self.max_sentence_len = n;
    self
  }

  pub fn retain(mut self, retain: Retain) -> Self {
    self.retain = retain;
    self
  }

  pub fn fine_beam(mut self, beam: Option<f64>) -> Self {
    self.fine_beam = beam;
    self
  }

  pub fn max_items(mut self, n: usize) -> Self {
    self.max_items = n;
    self
  }

  pub fn num_threads(mut self, n: usize) -> Self {
    self.num_threads = n;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.betas.is_empty() {
      return Err(Error::InvalidArgument("beta ladder is empty".into()));
    }
    if self.betas.iter().any(|b| !(*b > 0.0 && *b <= 1.0)) {
      return Err(Error::InvalidArgument(format!(
        "beta values must be in (0, 1]: {:?}",
        self.betas
      )));
    }
    if self.betas.windows(2).any(|w| w[1] >= w[0]) {
      return Err(Error::InvalidArgument(format!(
        "beta ladder must be strictly descending: {:?}",
        self.betas
      )));
    }
    if self.max_sentence_len == 0 || self.max_items == 0 || self.num_threads == 0 {
      return Err(Error::InvalidArgument(
        "max_sentence_len, max_items and num_threads must be positive".into(),
      ));
    }
    if let Retain::KBest(0) = self.retain {
      return Err(Error::InvalidArgument("k-best retention needs k >= 1".into()));
    }
    if let Some(beam) = self.fine_beam {
      if !(beam > 0.0 && beam < 1.0) {
        return Err(Error::InvalidArgument(format!("fine beam must be in (0, 1): {}", beam)));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
  pub iterations: usize,
  pub learning_rate: f64,
  /// Features seen fewer times than this in the training forests are dropped.
  pub feature_cutoff: u32,
  pub compression: Compression,
  /// Where packed forests are cached between epochs.
  pub work_dir: PathBuf,
  /// Where weights are written after every epoch, if anywhere.
  pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainerConfig {
  fn default() -> Self {
    Self {
      iterations: 10,
      learning_rate: 1.0,
      feature_cutoff: 1,
      compression: Compression::Zstd,
      work_dir: std::env::temp_dir().join("ccgbender"),
      checkpoint_dir: None,
    }
  }
}

impl TrainerConfig {
  pub fn new(work_dir: impl Into<PathBuf>) -> Self {
    Self {
      work_dir: work_dir.into(),
      ..Self::default()
    }
  }

  pub fn iterations(mut self, n: usize) -> Self {
    self.iterations = n;
    self
  }

  pub fn learning_rate(mut self, rate: f64) -> Self {
    self.learning_rate = rate;
    self
  }

  pub fn feature_cutoff(mut self, cutoff: u32) -> Self {
    self.feature_cutoff = cutoff;
    self
  }

  pub fn compression(mut self, compression: Compression) -> Self {
    self.compression = compression;
    self
  }

  pub fn checkpoint_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.checkpoint_dir = dir;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.iterations == 0 {
      return Err(Error::InvalidArgument("iterations must be at least 1".into()));
    }
    if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
      return Err(Error::InvalidArgument(format!(
        "learning rate must be positive: {}",
        self.learning_rate
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parser_config_validation() {
    assert!(ParserConfig::new().validate().is_ok());
    assert!(ParserConfig::new().betas(&[]).validate().is_err());
    assert!(ParserConfig::new().betas(&[0.01, 0.1]).validate().is_err());
    assert!(ParserConfig::new().betas(&[1.5]).validate().is_err());
    assert!(ParserConfig::new().retain(Retain::KBest(0)).validate().is_err());
    assert!(ParserConfig::new().fine_beam(Some(0.001)).validate().is_ok());
    assert!(matches!(
      ParserConfig::new().num_threads(0).validate(),
      Err(Error::InvalidArgument(_))
    ));
  }

  #[test]
  fn test_trainer_config_validation() {
    let c = TrainerConfig::new("/tmp/x").iterations(3).learning_rate(0.5);
    assert!(c.validate().is_ok());
    assert!(c.clone().iterations(0).validate().is_err());
    assert!(c.learning_rate(-1.0).validate().is_err());
  }
}
