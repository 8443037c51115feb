//! オプティマイザと学習率スケジューラ

use crate::nn::ParameterSet;
use crate::params::{ADAM_BETA1, ADAM_BETA2, LR_DECAY_EVERY, LR_DECAY_GAMMA};
use crate::precision::PrecisionMode;

/// オプティマイザ trait
pub trait Optimizer {
    /// パラメータを更新
    fn step(&mut self, params: &mut dyn ParameterSet);

    /// 学習率を設定
    fn set_lr(&mut self, lr: f32);

    /// 現在の学習率を取得
    fn get_lr(&self) -> f32;
}

/// パラメータごとのモーメント
#[derive(Clone, Debug, Default)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam オプティマイザ
#[derive(Clone, Debug)]
pub struct Adam {
    /// 学習率
    pub lr: f32,
    /// β1（一次モーメントの減衰率）
    pub beta1: f32,
    /// β2（二次モーメントの減衰率）
    pub beta2: f32,
    /// 数値安定性のための小さな値
    pub epsilon: f32,
    /// 更新後のパラメータを丸める精度
    precision: PrecisionMode,

    /// ステップ数
    t: u64,
    /// ParameterSet の走査順に対応するモーメント
    moments: Vec<Moments>,
}

impl Adam {
    /// 新しいAdamオプティマイザを作成（epsilon は精度モードから決まる）
    pub fn new(lr: f32, precision: PrecisionMode) -> Self {
        Self {
            lr,
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            epsilon: precision.epsilon(),
            precision,
            t: 0,
            moments: Vec::new(),
        }
    }

    /// β1を設定
    pub fn with_beta1(mut self, beta1: f32) -> Self {
        self.beta1 = beta1;
        self
    }

    /// β2を設定
    pub fn with_beta2(mut self, beta2: f32) -> Self {
        self.beta2 = beta2;
        self
    }

    /// 実行済みステップ数
    pub fn steps(&self) -> u64 {
        self.t
    }
}

/// Adamの更新式を適用（借用エラー回避のため独立関数として実装）
fn adam_update_params(
    params: &mut [f32],
    grads: &[f32],
    moments: &mut Moments,
    lr_t: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
) {
    for (((p, &g), m), v) in
        params.iter_mut().zip(grads).zip(moments.m.iter_mut()).zip(moments.v.iter_mut())
    {
        // モーメント更新
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;

        // パラメータ更新
        *p -= lr_t * *m / (v.sqrt() + epsilon);
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut dyn ParameterSet) {
        self.t += 1;
        let t = self.t as i32;

        // バイアス補正
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);
        let lr_t = self.lr * bias_correction2.sqrt() / bias_correction1;

        let (beta1, beta2, epsilon, precision) = (self.beta1, self.beta2, self.epsilon, self.precision);
        let moments = &mut self.moments;
        let mut index = 0;
        params.for_each_parameter_mut(&mut |_, param| {
            if moments.len() <= index {
                moments.push(Moments::default());
            }
            let slot = &mut moments[index];
            if slot.m.len() != param.len() {
                slot.m = vec![0.0; param.len()];
                slot.v = vec![0.0; param.len()];
            }
            adam_update_params(&mut param.values, &param.grads, slot, lr_t, beta1, beta2, epsilon);
            precision.round_slice(&mut param.values);
            index += 1;
        });
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn get_lr(&self) -> f32 {
        self.lr
    }
}

/// 指数減衰スケジューラ
///
/// `step` ごとに学習率へ gamma を掛ける。学習ループは
/// [`ExponentialDecay::decays_after`] が真のエポック終了時にのみ呼ぶ。
#[derive(Clone, Copy, Debug)]
pub struct ExponentialDecay {
    pub gamma: f32,
    pub every: usize,
    steps: usize,
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        Self::new(LR_DECAY_GAMMA, LR_DECAY_EVERY)
    }
}

impl ExponentialDecay {
    pub fn new(gamma: f32, every: usize) -> Self {
        Self { gamma, every: every.max(1), steps: 0 }
    }

    /// エポック `epoch`（0 始まり）の終了時に減衰するか
    pub fn decays_after(&self, epoch: usize) -> bool {
        epoch % self.every == self.every - 1
    }

    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.steps += 1;
        optimizer.set_lr(optimizer.get_lr() * self.gamma);
    }

    /// 適用済みの減衰回数
    pub fn steps(&self) -> usize {
        self.steps
    }
}
