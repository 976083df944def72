// Re-referencing of aligned electrode pairs

use super::synchronizer::AlignedPair;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the reference electrode is combined with the front electrode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceScheme {
    /// front - reference (bipolar derivation)
    Subtract,
    /// (front + reference) / 2
    Average,
}

impl Default for ReferenceScheme {
    fn default() -> Self {
        Self::Subtract
    }
}

impl FromStr for ReferenceScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .map_err(|_| format!("unknown reference scheme '{}' (subtract, average)", s))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReReferencer {
    scheme: ReferenceScheme,
}

impl ReReferencer {
    pub fn new(scheme: ReferenceScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> ReferenceScheme {
        self.scheme
    }

    /// Elementwise combination; output length equals `pair.len()`
    pub fn apply(&self, pair: &AlignedPair) -> Vec<f32> {
        let front = pair.front().iter();
        let reference = pair.reference().iter();
        match self.scheme {
            ReferenceScheme::Subtract => front.zip(reference).map(|(f, r)| f - r).collect(),
            ReferenceScheme::Average => front.zip(reference).map(|(f, r)| (f + r) * 0.5).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> AlignedPair {
        AlignedPair::new(
            vec![10.0, 20.0, -5.0],
            vec![4.0, 25.0, -5.0],
            vec![0.0, 4.0, 8.0],
        )
        .unwrap()
    }

    #[test]
    fn test_subtract() {
        let out = ReReferencer::default().apply(&pair());
        assert_eq!(out, vec![6.0, -5.0, 0.0]);
    }

    #[test]
    fn test_average() {
        let out = ReReferencer::new(ReferenceScheme::Average).apply(&pair());
        assert_eq!(out.len(), 3);
        assert_eq!(out, vec![7.0, 22.5, -5.0]);
    }
}
