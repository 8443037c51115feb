//! Cross-entropy loss and top-1 accuracy.
//!
//! Both are computed in f64 from the logits, so half-precision logits are
//! handled the same way as full-precision ones.

use crate::error::EvaluationError;
use crate::tensor::Logits;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossAndAccuracy {
    /// Mean negative log-likelihood of the true class
    pub loss: f64,
    /// Fraction of rows whose argmax equals the label
    pub accuracy: f64,
}

fn check(logits: &Logits, labels: &[usize]) -> Result<(), EvaluationError> {
    if logits.batch() != labels.len() {
        return Err(EvaluationError::BatchMismatch { logits: logits.batch(), labels: labels.len() });
    }
    let num_classes = logits.num_classes();
    match labels.iter().find(|&&label| label >= num_classes) {
        Some(&label) => Err(EvaluationError::LabelOutOfRange { label, num_classes }),
        None => Ok(()),
    }
}

/// Numerically stable log-sum-exp of one row
fn log_sum_exp(row: &[f32]) -> f64 {
    let max = row.iter().map(|&v| f64::from(v)).fold(f64::NEG_INFINITY, f64::max);
    max + row.iter().map(|&v| (f64::from(v) - max).exp()).sum::<f64>().ln()
}

/// Index of the first maximal logit
fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| if v > best_v { (i, v) } else { (best, best_v) })
        .0
}

pub fn cross_entropy_loss_and_accuracy(logits: &Logits, labels: &[usize]) -> Result<LossAndAccuracy, EvaluationError> {
    check(logits, labels)?;
    if labels.is_empty() {
        return Ok(LossAndAccuracy { loss: f64::NAN, accuracy: f64::NAN });
    }
    let mut loss = 0.0;
    let mut correct = 0usize;
    for (row, &label) in logits.rows().zip(labels) {
        loss += log_sum_exp(row) - f64::from(row[label]);
        if argmax(row) == label {
            correct += 1;
        }
    }
    let n = labels.len() as f64;
    Ok(LossAndAccuracy { loss: loss / n, accuracy: correct as f64 / n })
}

/// Gradient of the mean cross-entropy with respect to the logits:
/// `(softmax(row) - onehot(label)) / B`
pub fn cross_entropy_grad(logits: &Logits, labels: &[usize]) -> Result<Logits, EvaluationError> {
    check(logits, labels)?;
    let n = labels.len().max(1) as f64;
    let mut grad = Logits::zeros(logits.batch(), logits.num_classes());
    for (b, (row, &label)) in logits.rows().zip(labels).enumerate() {
        let lse = log_sum_exp(row);
        for (k, (g, &v)) in grad.row_mut(b).iter_mut().zip(row).enumerate() {
            let p = (f64::from(v) - lse).exp();
            let target = if k == label { 1.0 } else { 0.0 };
            *g = ((p - target) / n) as f32;
        }
    }
    Ok(grad)
}
