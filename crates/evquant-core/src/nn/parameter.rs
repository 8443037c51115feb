//! 学習可能パラメータと state dict

use crate::error::CheckpointError;
use crate::precision::PrecisionMode;
use std::collections::BTreeMap;

/// 値と勾配を持つ学習可能テンソル
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    shape: Vec<usize>,
    /// 値（row-major）
    pub values: Vec<f32>,
    /// 勾配（values と同じ長さ）
    pub grads: Vec<f32>,
}

impl Parameter {
    /// ゼロ初期化
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self { shape: shape.to_vec(), values: vec![0.0; len], grads: vec![0.0; len] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 勾配をゼロにリセット
    pub fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    pub fn to_tensor_data(&self) -> TensorData {
        TensorData { shape: self.shape.clone(), data: self.values.clone() }
    }
}

/// 保存用テンソル（形状 + 値）
#[derive(Clone, Debug, PartialEq)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// パラメータ名 → テンソル
pub type StateDict = BTreeMap<String, TensorData>;

/// 名前付きパラメータの集合
///
/// 走査順は実装ごとに固定で、オプティマイザのモーメントはこの順序に対応する。
pub trait ParameterSet {
    fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter));

    fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter));

    /// 全勾配をゼロにリセット
    fn zero_grad(&mut self) {
        self.for_each_parameter_mut(&mut |_, p| p.zero_grad());
    }

    /// パラメータ総数
    fn parameter_count(&self) -> usize {
        let mut count = 0;
        self.for_each_parameter(&mut |_, p| count += p.len());
        count
    }

    /// 保持している値を指定精度に丸める
    fn cast_parameters(&mut self, precision: PrecisionMode) {
        self.for_each_parameter_mut(&mut |_, p| precision.round_slice(&mut p.values));
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.for_each_parameter(&mut |name, p| {
            state.insert(name.to_string(), p.to_tensor_data());
        });
        state
    }

    /// state dict を読み込む
    ///
    /// キー集合と形状が完全に一致しない場合は何も変更せずにエラーを返す。
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), CheckpointError> {
        let mut problems = Vec::new();
        let mut matched = 0;
        self.for_each_parameter(&mut |name, p| match state.get(name) {
            None => problems.push(format!("missing key '{name}'")),
            Some(t) if t.shape != p.shape() || t.data.len() != p.len() => problems.push(format!(
                "shape mismatch for '{name}': expected {:?}, found {:?}",
                p.shape(),
                t.shape
            )),
            Some(_) => matched += 1,
        });
        if matched != state.len() {
            let mut known = Vec::new();
            self.for_each_parameter(&mut |name, _| known.push(name.to_string()));
            for key in state.keys().filter(|k| !known.contains(*k)) {
                problems.push(format!("unexpected key '{key}'"));
            }
        }
        if !problems.is_empty() {
            return Err(CheckpointError::StateDictMismatch(problems.join("; ")));
        }
        self.for_each_parameter_mut(&mut |name, p| {
            if let Some(t) = state.get(name) {
                p.values.copy_from_slice(&t.data);
            }
        });
        Ok(())
    }
}
