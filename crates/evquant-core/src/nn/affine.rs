//! 学習可能なアフィン変換層

use super::parameter::Parameter;
use rand::Rng;

/// 学習可能なアフィン変換層（入出力次元は実行時に決まる）
#[derive(Clone, Debug)]
pub struct Affine {
    input: usize,
    output: usize,
    /// 重み [output][input]
    pub weight: Parameter,
    /// バイアス [output]
    pub bias: Parameter,
}

impl Affine {
    /// 新しい層を作成（ゼロ初期化）
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input,
            output,
            weight: Parameter::zeros(&[output, input]),
            bias: Parameter::zeros(&[output]),
        }
    }

    /// 一様分布 U(-1/sqrt(input), 1/sqrt(input)) で初期化
    pub fn init_uniform<R: Rng>(&mut self, rng: &mut R) {
        let bound = 1.0 / (self.input as f32).sqrt();
        for w in self.weight.values.iter_mut().chain(self.bias.values.iter_mut()) {
            *w = rng.random::<f32>() * 2.0 * bound - bound;
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input
    }

    pub fn output_dim(&self) -> usize {
        self.output
    }

    /// 順伝播
    pub fn forward(&self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.input);
        debug_assert_eq!(output.len(), self.output);

        for (j, out) in output.iter_mut().enumerate() {
            let row = &self.weight.values[j * self.input..(j + 1) * self.input];
            let mut sum = self.bias.values[j];
            for (&w, &inp) in row.iter().zip(input) {
                sum += w * inp;
            }
            *out = sum;
        }
    }

    /// 逆伝播（出力勾配から入力勾配を計算し、重み勾配を累積）
    pub fn backward(&mut self, input: &[f32], output_grad: &[f32], input_grad: &mut [f32]) {
        debug_assert_eq!(input.len(), self.input);
        debug_assert_eq!(output_grad.len(), self.output);
        debug_assert_eq!(input_grad.len(), self.input);

        input_grad.fill(0.0);

        for (j, &grad) in output_grad.iter().enumerate() {
            if grad == 0.0 {
                continue;
            }
            self.bias.grads[j] += grad;
            let base = j * self.input;
            for i in 0..self.input {
                self.weight.grads[base + i] += grad * input[i];
                input_grad[i] += grad * self.weight.values[base + i];
            }
        }
    }

    /// `prefix.weight` / `prefix.bias` の名前でパラメータを列挙
    pub fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, &Parameter)) {
        f(&format!("{prefix}.weight"), &self.weight);
        f(&format!("{prefix}.bias"), &self.bias);
    }

    pub fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&format!("{prefix}.weight"), &mut self.weight);
        f(&format!("{prefix}.bias"), &mut self.bias);
    }
}

/// Leaky ReLU
#[inline]
pub fn leaky_relu(x: f32, slope: f32) -> f32 {
    if x > 0.0 { x } else { slope * x }
}

/// Leaky ReLU の微分（入力は活性化前の値）
#[inline]
pub fn leaky_relu_grad(x: f32, slope: f32) -> f32 {
    if x > 0.0 { 1.0 } else { slope }
}
