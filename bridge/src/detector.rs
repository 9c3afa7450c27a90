//! Confidence-outlier detection
//!
//! A score is an outlier when it lies strictly more than `sigma` population
//! standard deviations from the mean. A round is Byzantine-suspect when the
//! outlier share exceeds `max_outlier_fraction`. The signal is advisory.

use concordia_core::{ChainId, DetectorConfig};
use serde::{Deserialize, Serialize};

/// Outcome of one detection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub mean: f64,
    pub std_dev: f64,
    pub outliers: Vec<ChainId>,
    pub suspect: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByzantineDetector {
    config: DetectorConfig,
}

impl ByzantineDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
    
    pub fn analyze<'a, I>(&self, scores: I) -> DetectionReport
    where
        I: IntoIterator<Item = (&'a ChainId, f64)>,
    {
        let scores: Vec<(&ChainId, f64)> = scores.into_iter().collect();
        if scores.len() < 2 {
            return DetectionReport::default();
        }
        
        let n = scores.len() as f64;
        let mean = scores.iter().map(|(_, s)| s).sum::<f64>() / n;
        let variance = scores.iter().map(|(_, s)| (s - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        
        let mut outliers: Vec<ChainId> = if std_dev > 0.0 {
            scores
                .iter()
                .filter(|(_, s)| (s - mean).abs() > self.config.sigma * std_dev)
                .map(|(c, _)| (*c).clone())
                .collect()
        } else {
            Vec::new()
        };
        outliers.sort();
        let suspect = outliers.len() as f64 > n * self.config.max_outlier_fraction;
        
        DetectionReport {
            mean,
            std_dev,
            outliers,
            suspect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    fn scored(values: &[f64]) -> Vec<(ChainId, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (ChainId::new(format!("chain-{}", i)), *v))
            .collect()
    }
    
    fn run(detector: &ByzantineDetector, scores: &[(ChainId, f64)]) -> DetectionReport {
        detector.analyze(scores.iter().map(|(c, s)| (c, *s)))
    }
    
    #[test]
    fn test_single_dissenter_is_not_an_outlier() {
        let detector = ByzantineDetector::default();
        let report = run(&detector, &scored(&[0.9, 0.9, 0.9, 0.1]));
        
        assert!((report.mean - 0.7).abs() < 1e-9);
        assert!(report.outliers.is_empty());
        assert!(!report.suspect);
    }
    
    #[test]
    fn test_outlier_beyond_sigma() {
        let detector = ByzantineDetector::default();
        let mut values = vec![0.5; 9];
        values.push(1.0);
        let report = run(&detector, &scored(&values));
        
        assert_eq!(report.outliers, vec![ChainId::from("chain-9")]);
        // One outlier among ten stays below a third
        assert!(!report.suspect);
    }
    
    #[test]
    fn test_suspect_iff_fraction_exceeded() {
        let detector = ByzantineDetector::new(DetectorConfig {
            sigma: 1.0,
            max_outlier_fraction: 1.0 / 3.0,
        });
        // Mean 0.5, σ ≈ 0.41: the four extremes are outliers
        let report = run(&detector, &scored(&[0.0, 0.0, 1.0, 1.0, 0.5, 0.5]));
        assert_eq!(report.outliers.len(), 4);
        assert!(report.suspect);
        
        // Mean 0.5, σ ≈ 0.29: only the two extremes, exactly a third
        let report = run(&detector, &scored(&[0.0, 1.0, 0.5, 0.5, 0.5, 0.5]));
        assert_eq!(report.outliers.len(), 2);
        assert!(!report.suspect);
    }
    
    #[test]
    fn test_uniform_scores_have_no_outliers() {
        let report = run(&ByzantineDetector::default(), &scored(&[0.4, 0.4, 0.4]));
        assert_eq!(report.std_dev, 0.0);
        assert!(report.outliers.is_empty());
    }
}
