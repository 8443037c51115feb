//! ニューラルネットワークの基本部品
//!
//! f32 で順伝播・逆伝播を行う層とパラメータ管理。

pub mod affine;
pub mod parameter;

pub use affine::{Affine, leaky_relu, leaky_relu_grad};
pub use parameter::{Parameter, ParameterSet, StateDict, TensorData};
