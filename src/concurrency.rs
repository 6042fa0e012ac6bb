use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::LimitError;

const EXPECTED: &str = "expected a whole number from 1 and up, or `unbounded`";

/// Upper bound on the number of tasks a limiter lets run at once.
///
/// Accepted spellings: any positive integer, or `unbounded` / `infinity` /
/// `inf` (and `f64::INFINITY`) for a limiter that never queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "RawConcurrency")]
pub enum Concurrency {
    Limited(NonZeroUsize),
    Unbounded,
}

impl Concurrency {
    pub fn new(limit: usize) -> Result<Self, LimitError> {
        NonZeroUsize::new(limit)
            .map(Concurrency::Limited)
            .ok_or_else(|| LimitError::invalid(limit, EXPECTED))
    }

    /// The numeric bound, or `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Concurrency::Limited(n) => Some(n.get()),
            Concurrency::Unbounded => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Concurrency::Unbounded)
    }

    /// Whether one more task may start while `active` are already running.
    pub(crate) fn admits(&self, active: usize) -> bool {
        match self {
            Concurrency::Limited(n) => active < n.get(),
            Concurrency::Unbounded => true,
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Limited(n) => write!(f, "{n}"),
            Concurrency::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl From<NonZeroUsize> for Concurrency {
    fn from(n: NonZeroUsize) -> Self {
        Concurrency::Limited(n)
    }
}

impl TryFrom<usize> for Concurrency {
    type Error = LimitError;

    fn try_from(limit: usize) -> Result<Self, Self::Error> {
        Concurrency::new(limit)
    }
}

impl TryFrom<i64> for Concurrency {
    type Error = LimitError;

    fn try_from(limit: i64) -> Result<Self, Self::Error> {
        let limit = usize::try_from(limit).map_err(|_| LimitError::invalid(limit, EXPECTED))?;
        Concurrency::new(limit)
    }
}

impl TryFrom<f64> for Concurrency {
    type Error = LimitError;

    fn try_from(limit: f64) -> Result<Self, Self::Error> {
        if limit == f64::INFINITY {
            return Ok(Concurrency::Unbounded);
        }
        if !limit.is_finite() || limit.fract() != 0.0 || limit < 1.0 {
            return Err(LimitError::invalid(limit, EXPECTED));
        }
        if limit > usize::MAX as f64 {
            return Err(LimitError::invalid(limit, "bound does not fit in usize"));
        }
        Concurrency::new(limit as usize)
    }
}

impl FromStr for Concurrency {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "unbounded" | "infinity" | "inf" => return Ok(Concurrency::Unbounded),
            "" => return Err(LimitError::invalid(s, EXPECTED)),
            _ => {}
        }

        if let Ok(n) = trimmed.parse::<i64>() {
            return Concurrency::try_from(n);
        }
        match trimmed.parse::<f64>() {
            Ok(f) => Concurrency::try_from(f),
            Err(_) => Err(LimitError::invalid(s, EXPECTED)),
        }
    }
}

/// Every shape a bound can take in a YAML/JSON document.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawConcurrency {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<RawConcurrency> for Concurrency {
    type Error = LimitError;

    fn try_from(raw: RawConcurrency) -> Result<Self, Self::Error> {
        match raw {
            RawConcurrency::Int(n) => Concurrency::try_from(n),
            RawConcurrency::Float(f) => Concurrency::try_from(f),
            RawConcurrency::Text(s) => s.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        let err = Concurrency::new(0).unwrap_err();
        assert!(matches!(err, LimitError::InvalidArgument { .. }), "{err}");
    }

    #[test]
    fn negative_and_fractional_bounds_are_rejected() {
        assert!(Concurrency::try_from(-1i64).is_err());
        assert!(Concurrency::try_from(1.5f64).is_err());
        assert!(Concurrency::try_from(0.0f64).is_err());
        assert!(Concurrency::try_from(f64::NAN).is_err());
        assert!(Concurrency::try_from(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn whole_floats_and_infinity_are_accepted() {
        assert_eq!(Concurrency::try_from(3.0f64).unwrap().limit(), Some(3));
        assert_eq!(
            Concurrency::try_from(f64::INFINITY).unwrap(),
            Concurrency::Unbounded
        );
    }

    #[test]
    fn parses_text_spellings() {
        assert_eq!("4".parse::<Concurrency>().unwrap().limit(), Some(4));
        assert_eq!(" 2.0 ".parse::<Concurrency>().unwrap().limit(), Some(2));
        assert!("Unbounded".parse::<Concurrency>().unwrap().is_unbounded());
        assert!("inf".parse::<Concurrency>().unwrap().is_unbounded());
        assert!("0".parse::<Concurrency>().is_err());
        assert!("-3".parse::<Concurrency>().is_err());
        assert!("two".parse::<Concurrency>().is_err());
        assert!("".parse::<Concurrency>().is_err());
    }

    #[test]
    fn admits_respects_the_bound() {
        let c = Concurrency::new(2).unwrap();
        assert!(c.admits(0));
        assert!(c.admits(1));
        assert!(!c.admits(2));
        assert!(Concurrency::Unbounded.admits(usize::MAX - 1));
    }

    #[test]
    fn deserializes_from_yaml_scalars() {
        let c: Concurrency = serde_yaml::from_str("3").unwrap();
        assert_eq!(c.limit(), Some(3));
        let c: Concurrency = serde_yaml::from_str("unbounded").unwrap();
        assert!(c.is_unbounded());
        let c: Concurrency = serde_yaml::from_str(".inf").unwrap();
        assert!(c.is_unbounded());
        assert!(serde_yaml::from_str::<Concurrency>("0").is_err());
        assert!(serde_yaml::from_str::<Concurrency>("2.5").is_err());
    }

    #[test]
    fn displays_like_it_parses() {
        assert_eq!(Concurrency::new(8).unwrap().to_string(), "8");
        assert_eq!(Concurrency::Unbounded.to_string(), "unbounded");
    }
}
