//! 学習状態と再開位置の計算

use crate::checkpoint::Checkpoint;
use std::fmt;

/// コントローラが単独で所有する可変カウンタ
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingState {
    /// 処理済みの空でない学習バッチ数（オプティマイザのステップ数）
    pub iteration: u64,
    /// これまでの最小検証損失（未観測なら +inf）
    pub min_validation_loss: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self { iteration: 0, min_validation_loss: f64::INFINITY }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self { iteration: checkpoint.iteration, min_validation_loss: checkpoint.min_val_loss }
    }

    /// 検証損失を記録し、厳密に改善した場合のみ true を返す
    ///
    /// NaN は常に改善なしとして扱う。
    pub fn observe_validation(&mut self, loss: f64) -> bool {
        if loss < self.min_validation_loss {
            self.min_validation_loss = loss;
            true
        } else {
            false
        }
    }
}

/// 再開時の開始エポック: `round(iteration / batches_per_epoch)`（偶数丸め）
///
/// 切り捨てではなく丸めのため、途中まで進んだエポックは残り半分未満なら
/// 丸ごと飛ばされ、そうでなければ最初からやり直される。
pub fn resume_start_epoch(iteration: u64, batches_per_epoch: usize) -> usize {
    if batches_per_epoch == 0 {
        return 0;
    }
    (iteration as f64 / batches_per_epoch as f64).round_ties_even() as usize
}

/// エポック内のフェーズ
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Training,
    Validation,
    Testing,
}

impl Phase {
    /// メトリクス名の接頭辞
    pub fn tag(self) -> &'static str {
        match self {
            Phase::Training => "training",
            Phase::Validation => "validation",
            Phase::Testing => "testing",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::Training => "Training",
            Phase::Validation => "Validation",
            Phase::Testing => "Testing",
        }
    }

    /// 勾配計算とパラメータ更新を行うか
    pub fn updates_parameters(self) -> bool {
        matches!(self, Phase::Training)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_rounds_instead_of_flooring() {
        assert_eq!(resume_start_epoch(237, 50), 5);
        assert_eq!(resume_start_epoch(224, 50), 4);
        assert_eq!(resume_start_epoch(0, 50), 0);
        // 2.5 は偶数側へ
        assert_eq!(resume_start_epoch(125, 50), 2);
        assert_eq!(resume_start_epoch(175, 50), 4);
        assert_eq!(resume_start_epoch(10, 0), 0);
    }

    #[test]
    fn best_loss_requires_strict_improvement() {
        let mut state = TrainingState::new();
        let improved: Vec<bool> =
            [0.9, 0.7, 0.8, 0.6, 0.6].iter().map(|&l| state.observe_validation(l)).collect();
        assert_eq!(improved, vec![true, true, false, true, false]);
        assert_eq!(state.min_validation_loss, 0.6);
        assert!(!state.observe_validation(f64::NAN));
    }

    #[test]
    fn state_from_checkpoint() {
        let ckpt = Checkpoint { state_dict: Default::default(), iteration: 42, min_val_loss: 1.25 };
        let state = TrainingState::from_checkpoint(&ckpt);
        assert_eq!(state, TrainingState { iteration: 42, min_validation_loss: 1.25 });
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Validation.tag(), "validation");
        assert_eq!(Phase::Testing.title(), "Testing");
        assert!(Phase::Training.updates_parameters());
        assert!(!Phase::Testing.updates_parameters());
    }
}
