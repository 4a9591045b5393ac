// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Distance functions over raw component slices.
//!
//! All functions reject dimension-mismatched inputs with
//! [`Error::DimensionMismatch`] instead of silently truncating. The three
//! supported metrics satisfy the metric-space axioms the k-NN search
//! relies on: `d(p,p) = 0`, symmetry, and non-negativity.

use crate::error::{Error, Result};
use std::str::FromStr;

/// Signature shared by every distance function.
pub type DistanceFn = fn(&[f64], &[f64]) -> Result<f64>;

/// Supported distance metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    /// Euclidean (L2) distance.
    #[default]
    Euclidean,
    /// Manhattan (L1) distance.
    Manhattan,
    /// Chebyshev (L∞) distance.
    Chebyshev,
}

impl Distance {
    /// Resolve to the corresponding distance function.
    pub fn func(self) -> DistanceFn {
        match self {
            Distance::Euclidean => euclidean,
            Distance::Manhattan => manhattan,
            Distance::Chebyshev => chebyshev,
        }
    }

    /// Compute the distance between two component slices.
    pub fn compute(self, a: &[f64], b: &[f64]) -> Result<f64> {
        (self.func())(a, b)
    }
}

impl FromStr for Distance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "EUCLIDEAN" => Ok(Distance::Euclidean),
            "MANHATTAN" => Ok(Distance::Manhattan),
            "CHEBYSHEV" => Ok(Distance::Chebyshev),
            other => Err(format!("unknown distance function: {}", other)),
        }
    }
}

fn check_dims(a: &[f64], b: &[f64]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(())
}

/// Euclidean (L2) distance.
pub fn euclidean(a: &[f64], b: &[f64]) -> Result<f64> {
    check_dims(a, b)?;
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(sum.sqrt())
}

/// Manhattan (L1) distance.
pub fn manhattan(a: &[f64], b: &[f64]) -> Result<f64> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum())
}

/// Chebyshev (L∞) distance.
pub fn chebyshev(a: &[f64], b: &[f64]) -> Result<f64> {
    check_dims(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean() {
        let d = euclidean(&[0.0, 0.0], &[3.0, 4.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_manhattan() {
        let d = manhattan(&[1.0, 1.0], &[4.0, 5.0]).unwrap();
        assert_eq!(d, 7.0);
    }

    #[test]
    fn test_chebyshev() {
        let d = chebyshev(&[1.0, 1.0], &[4.0, 5.0]).unwrap();
        assert_eq!(d, 4.0);
    }

    #[test]
    fn test_identity() {
        for metric in [Distance::Euclidean, Distance::Manhattan, Distance::Chebyshev] {
            let d = metric.compute(&[1.5, -2.5, 3.0], &[1.5, -2.5, 3.0]).unwrap();
            assert_eq!(d, 0.0, "{:?} must be zero on identical points", metric);
        }
    }

    #[test]
    fn test_symmetry() {
        let a = [1.0, 2.0, 3.0];
        let b = [-4.0, 0.5, 9.0];
        for metric in [Distance::Euclidean, Distance::Manhattan, Distance::Chebyshev] {
            let ab = metric.compute(&a, &b).unwrap();
            let ba = metric.compute(&b, &a).unwrap();
            assert_eq!(ab, ba, "{:?} must be symmetric", metric);
            assert!(ab >= 0.0);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        for metric in [Distance::Euclidean, Distance::Manhattan, Distance::Chebyshev] {
            let err = metric.compute(&[1.0, 2.0], &[1.0]).unwrap_err();
            assert!(matches!(err, Error::DimensionMismatch { .. }));
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("EUCLIDEAN".parse::<Distance>().unwrap(), Distance::Euclidean);
        assert_eq!("CHEBYSHEV".parse::<Distance>().unwrap(), Distance::Chebyshev);
        assert_eq!("MANHATTAN".parse::<Distance>().unwrap(), Distance::Manhattan);
        assert!("COSINE".parse::<Distance>().is_err());
    }
}
