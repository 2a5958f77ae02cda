//! Physical units attached to fields, volumes and derived quantities.
//!
//! A [`Unit`] is a product of base symbols raised to integer powers, e.g. `V m^-3`. This is
//! enough to track what happens to units through deconvolution, normalization and norms.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    powers: BTreeMap<String, i32>,
}

impl Unit {
    /// The unit of a pure number.
    pub fn dimensionless() -> Self {
        Self::default()
    }

    /// Parses a space separated product such as `"m"`, `"V m^-2"` or `"A^2"`.
    ///
    /// Unparsable exponents are treated as 1.
    pub fn new(text: &str) -> Self {
        let mut unit = Self::default();
        for token in text.split_whitespace() {
            let (symbol, power) = match token.split_once('^') {
                Some((symbol, power)) => (symbol, power.parse::<i32>().unwrap_or(1)),
                None => (token, 1),
            };
            unit.add(symbol, power);
        }
        unit
    }

    fn add(&mut self, symbol: &str, power: i32) {
        if symbol.is_empty() || power == 0 {
            return;
        }
        let entry = self.powers.entry(symbol.to_string()).or_insert(0);
        *entry += power;
        if *entry == 0 {
            self.powers.remove(symbol);
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.powers.is_empty()
    }

    pub fn multiply(&self, other: &Unit) -> Unit {
        self.power_multiply(1, other, 1)
    }

    pub fn divide(&self, other: &Unit) -> Unit {
        self.power_multiply(1, other, -1)
    }

    pub fn powi(&self, power: i32) -> Unit {
        let mut unit = Self::default();
        for (symbol, p) in &self.powers {
            unit.add(symbol, p * power);
        }
        unit
    }

    /// Computes `self^p1 * other^p2`.
    pub fn power_multiply(&self, p1: i32, other: &Unit, p2: i32) -> Unit {
        let mut unit = self.powi(p1);
        for (symbol, p) in &other.powers {
            unit.add(symbol, p * p2);
        }
        unit
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (symbol, power) in &self.powers {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if *power == 1 {
                write!(f, "{symbol}")?;
            } else {
                write!(f, "{symbol}^{power}")?;
            }
        }
        Ok(())
    }
}
