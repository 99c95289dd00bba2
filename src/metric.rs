// src/metric.rs
//
// Classification accuracy over learned latent representations. The
// original pipelines hand the pooled topic scores to an external SVM; here
// the scoring step keeps the same contract with in-crate classifiers.

use ndarray::{Array1, Array2, ArrayView1};

#[derive(Debug)]
pub enum MetricError {
    EmptyInput(String),
    ShapeMismatch(String),
    InvalidClassifier(String),
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricError::EmptyInput(s) => write!(f, "Empty input: {}", s),
            MetricError::ShapeMismatch(s) => write!(f, "Shape mismatch: {}", s),
            MetricError::InvalidClassifier(s) => write!(f, "Invalid classifier: {}", s),
        }
    }
}

impl std::error::Error for MetricError {}

/// Classifier used to score a latent representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classifier {
    /// Cosine similarity to per-class centroids.
    NearestCentroid,
    /// Cosine k-nearest-neighbour majority vote.
    Knn(usize),
}

fn cosine(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let dot = a.dot(&b);
    let na = a.dot(&a).sqrt();
    let nb = b.dot(&b).sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn check_features(
    features: &Array2<f64>,
    labels: &[usize],
    name: &str,
) -> Result<(), MetricError> {
    if features.nrows() == 0 {
        return Err(MetricError::EmptyInput(format!("{} features", name)));
    }
    if features.nrows() != labels.len() {
        return Err(MetricError::ShapeMismatch(format!(
            "{} has {} rows but {} labels",
            name,
            features.nrows(),
            labels.len()
        )));
    }
    Ok(())
}

/// Fraction of test samples whose predicted label matches. Feature matrices
/// are sample-major: one row per document.
pub fn classification_accuracy(
    train_features: &Array2<f64>,
    test_features: &Array2<f64>,
    train_labels: &[usize],
    test_labels: &[usize],
    classifier: Classifier,
) -> Result<f64, MetricError> {
    check_features(train_features, train_labels, "train")?;
    check_features(test_features, test_labels, "test")?;
    if train_features.ncols() != test_features.ncols() {
        return Err(MetricError::ShapeMismatch(format!(
            "train has {} feature columns, test has {}",
            train_features.ncols(),
            test_features.ncols()
        )));
    }

    let predictions = match classifier {
        Classifier::NearestCentroid => {
            predict_nearest_centroid(train_features, test_features, train_labels)
        }
        Classifier::Knn(k) => {
            if k == 0 {
                return Err(MetricError::InvalidClassifier(
                    "k must be positive".to_string(),
                ));
            }
            predict_knn(train_features, test_features, train_labels, k)
        }
    };

    let correct = predictions
        .iter()
        .zip(test_labels.iter())
        .filter(|(p, t)| p == t)
        .count();
    Ok(correct as f64 / test_labels.len() as f64)
}

fn predict_nearest_centroid(
    train: &Array2<f64>,
    test: &Array2<f64>,
    labels: &[usize],
) -> Vec<usize> {
    let n_classes = labels.iter().copied().max().unwrap_or(0) + 1;
    let d = train.ncols();
    let mut centroids = Array2::<f64>::zeros((n_classes, d));
    let mut counts = Array1::<f64>::zeros(n_classes);
    for (row, &label) in train.rows().into_iter().zip(labels.iter()) {
        let mut c = centroids.row_mut(label);
        c += &row;
        counts[label] += 1.0;
    }
    for (mut c, &cnt) in centroids.rows_mut().into_iter().zip(counts.iter()) {
        if cnt > 0.0 {
            c.mapv_inplace(|x| x / cnt);
        }
    }

    test.rows()
        .into_iter()
        .map(|row| {
            let mut best = 0usize;
            let mut best_sim = f64::NEG_INFINITY;
            for (label, c) in centroids.rows().into_iter().enumerate() {
                if counts[label] == 0.0 {
                    continue;
                }
                let sim = cosine(row, c);
                if sim > best_sim {
                    best_sim = sim;
                    best = label;
                }
            }
            best
        })
        .collect()
}

fn predict_knn(
    train: &Array2<f64>,
    test: &Array2<f64>,
    labels: &[usize],
    k: usize,
) -> Vec<usize> {
    let k = k.min(train.nrows());
    let n_classes = labels.iter().copied().max().unwrap_or(0) + 1;

    test.rows()
        .into_iter()
        .map(|row| {
            let mut sims: Vec<(f64, usize)> = train
                .rows()
                .into_iter()
                .zip(labels.iter())
                .map(|(t, &label)| (cosine(row, t), label))
                .collect();
            sims.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            let mut votes = vec![0usize; n_classes];
            for &(_, label) in sims.iter().take(k) {
                votes[label] += 1;
            }
            // Majority vote; ties go to the nearest neighbour among the
            // tied classes.
            let max_votes = votes.iter().copied().max().unwrap_or(0);
            sims.iter()
                .take(k)
                .find(|&&(_, label)| votes[label] == max_votes)
                .map(|&(_, label)| label)
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array2<f64>, Vec<usize>, Vec<usize>) {
        let train = array![
            [10.0, 0.1],
            [9.0, 0.2],
            [8.0, 0.0],
            [0.2, 9.0],
            [0.0, 10.0],
            [0.1, 8.0],
        ];
        let test = array![[7.0, 0.3], [0.2, 7.5]];
        (train, test, vec![0, 0, 0, 1, 1, 1], vec![0, 1])
    }

    #[test]
    fn test_nearest_centroid_on_separable_data() {
        let (train, test, train_labels, test_labels) = separable();
        let acc = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &test_labels,
            Classifier::NearestCentroid,
        )
        .unwrap();
        assert_eq!(acc, 1.0);
    }

    #[test]
    fn test_knn_on_separable_data() {
        let (train, test, train_labels, test_labels) = separable();
        let acc = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &test_labels,
            Classifier::Knn(3),
        )
        .unwrap();
        assert_eq!(acc, 1.0);
    }

    #[test]
    fn test_knn_larger_than_train_set_is_clamped() {
        let (train, test, train_labels, test_labels) = separable();
        let acc = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &test_labels,
            Classifier::Knn(100),
        )
        .unwrap();
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn test_zero_k_rejected() {
        let (train, test, train_labels, test_labels) = separable();
        let result = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &test_labels,
            Classifier::Knn(0),
        );
        assert!(matches!(result, Err(MetricError::InvalidClassifier(_))));
    }

    #[test]
    fn test_label_length_mismatch() {
        let (train, test, train_labels, _) = separable();
        let result = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &[0],
            Classifier::NearestCentroid,
        );
        assert!(matches!(result, Err(MetricError::ShapeMismatch(_))));
    }

    #[test]
    fn test_feature_dim_mismatch() {
        let (train, _, train_labels, test_labels) = separable();
        let test = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let result = classification_accuracy(
            &train,
            &test,
            &train_labels,
            &test_labels,
            Classifier::NearestCentroid,
        );
        assert!(matches!(result, Err(MetricError::ShapeMismatch(_))));
    }

    #[test]
    fn test_empty_train_rejected() {
        let train = Array2::<f64>::zeros((0, 2));
        let test = array![[1.0, 2.0]];
        let result =
            classification_accuracy(&train, &test, &[], &[0], Classifier::NearestCentroid);
        assert!(matches!(result, Err(MetricError::EmptyInput(_))));
    }

    #[test]
    fn test_single_class_predicts_that_class() {
        let train = array![[1.0, 1.0], [2.0, 2.0]];
        let test = array![[3.0, 3.0]];
        let acc = classification_accuracy(
            &train,
            &test,
            &[5, 5],
            &[5],
            Classifier::NearestCentroid,
        )
        .unwrap();
        assert_eq!(acc, 1.0);
    }
}
