//! Conditional distributions with Witten-Bell backoff.
//!
//! Contexts are slices of symbol ids ordered from most to least general, so
//! backing off means looking at a shorter prefix of the same context.

use hashbrown::{HashMap, HashSet};

use crate::utils::{Score, log};

#[derive(Debug, Clone, Default)]
struct Counts {
  total: u64,
  outcomes: HashMap<u32, u64>,
}

/// Relative-frequency estimates of `P(outcome | context[..width])`.
#[derive(Debug, Clone)]
pub struct Distribution {
  width: usize,
  contexts: HashMap<Box<[u32]>, Counts>,
  vocab: HashSet<u32>,
}

impl Distribution {
  pub fn new(width: usize) -> Self {
    Self {
      width,
      contexts: HashMap::new(),
      vocab: HashSet::new(),
    }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  fn key<'c>(&self, context: &'c [u32]) -> &'c [u32] {
    &context[..self.width.min(context.len())]
  }

  pub fn observe(&mut self, context: &[u32], outcome: u32) {
    let key = self.key(context);
    let counts = self.contexts.entry_ref(key).or_default();
    counts.total += 1;
    *counts.outcomes.entry(outcome).or_insert(0) += 1;
    self.vocab.insert(outcome);
  }

  /// Interpolates the relative frequency of `outcome` in `context` with `lower`.
  fn interpolate(&self, context: &[u32], outcome: u32, lower: f64) -> f64 {
    let Some(counts) = self.contexts.get(self.key(context)) else {
      return lower;
    };
    let n = counts.total as f64;
    let t = counts.outcomes.len() as f64;
    let lambda = n / (n + t);
    let seen = counts.outcomes.get(&outcome).copied().unwrap_or(0) as f64;
    lambda * (seen / n) + (1.0 - lambda) * lower
  }
}

/// A chain of distributions from the most specific context down to a base.
#[derive(Debug, Clone)]
pub enum Backoff {
  Specific(Distribution, Box<Backoff>),
  Base(Distribution),
}

impl Backoff {
  /// One level per context width from `full` down to `base`.
  pub fn chain(full: usize, base: usize) -> Self {
    if full <= base {
      Self::Base(Distribution::new(base))
    } else {
      Self::Specific(Distribution::new(full), Box::new(Self::chain(full - 1, base)))
    }
  }

  /// Counts the event at every level.
  pub fn observe(&mut self, context: &[u32], outcome: u32) {
    match self {
      Self::Specific(d, rest) => {
        d.observe(context, outcome);
        rest.observe(context, outcome);
      }
      Self::Base(d) => d.observe(context, outcome),
    }
  }

  /// Smoothed probability; the base level backs off to a uniform
  /// distribution over the seen outcomes plus one unseen outcome, so the
  /// result is always positive.
  pub fn prob(&self, context: &[u32], outcome: u32) -> f64 {
    match self {
      Self::Specific(d, rest) => d.interpolate(context, outcome, rest.prob(context, outcome)),
      Self::Base(d) => {
        let uniform = 1.0 / (d.vocab.len() as f64 + 1.0);
        d.interpolate(context, outcome, uniform)
      }
    }
  }

  pub fn log_prob(&self, context: &[u32], outcome: u32) -> Score {
    log::from_prob(self.prob(context, outcome))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unseen_context_backs_off() {
    let mut b = Backoff::chain(2, 1);
    b.observe(&[1, 10], 7);
    b.observe(&[1, 10], 7);
    b.observe(&[1, 11], 8);

    // [1, 12] was never seen: only the base level contributes
    let backed = b.prob(&[1, 12], 7);
    let Backoff::Specific(_, base) = &b else {
      panic!("expected a chain");
    };
    assert!((backed - base.prob(&[1, 12], 7)).abs() < 1e-12);

    // the specific context sharpens the estimate
    assert!(b.prob(&[1, 10], 7) > backed);
    assert!(b.prob(&[1, 10], 8) < b.prob(&[1, 11], 8));
  }

  #[test]
  fn test_witten_bell_weights() {
    let mut b = Backoff::chain(1, 1);
    for _ in 0..3 {
      b.observe(&[4], 1);
    }
    b.observe(&[4], 2);
    // n = 4, t = 2, lambda = 2/3, uniform = 1/3
    let p = b.prob(&[4], 1);
    assert!((p - (2.0 / 3.0 * 0.75 + 1.0 / 3.0 * (1.0 / 3.0))).abs() < 1e-12);
    assert!(b.prob(&[4], 99) > 0.0);
  }

  #[test]
  fn test_distributions_sum_to_one_over_seen_and_unseen() {
    let mut b = Backoff::chain(2, 1);
    b.observe(&[0, 1], 5);
    b.observe(&[0, 2], 6);
    b.observe(&[0, 1], 6);
    let seen = b.prob(&[0, 1], 5) + b.prob(&[0, 1], 6);
    let unseen = b.prob(&[0, 1], 1000);
    assert!((seen + unseen - 1.0).abs() < 1e-9);
    assert_eq!(b.log_prob(&[0, 1], 5), b.prob(&[0, 1], 5).ln());
  }
}
