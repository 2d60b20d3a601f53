use serde::{Deserialize, Serialize};

/// Reshapes a numeric modulation value on its way to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Transform {
    /// `x + a`
    #[serde(rename = "constant")]
    ConstantOffset(f64),
    /// `a * x + b`
    #[serde(rename = "linearScale")]
    Linear(f64, f64),
    /// `a + b * x + c * x^2 + ...`
    #[serde(rename = "polynomial")]
    Polynomial(Vec<f64>),
    /// `a * b^x`
    #[serde(rename = "exponential")]
    Exponential(f64, f64),
}

impl Transform {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Self::ConstantOffset(a) => x + a,
            Self::Linear(a, b) => a * x + b,
            Self::Polynomial(coefficients) => coefficients
                .iter()
                .enumerate()
                .map(|(power, c)| c * x.powi(power as i32))
                .sum(),
            Self::Exponential(a, b) => a * b.powf(x),
        }
    }
}

/// Applies every transform in order.
pub fn apply_chain(chain: &[Transform], x: f64) -> f64 {
    chain.iter().fold(x, |value, transform| transform.apply(value))
}
