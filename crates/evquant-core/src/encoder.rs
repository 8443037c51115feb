//! Learned event-to-tensor quantization.
//!
//! Every event contributes to all temporal bins of its polarity channel
//! group. The contribution to bin `i` is `t̂ · v(t̂ - i/(bins-1))` where `t̂`
//! is the event time normalized by its sample's maximum and `v` is a small
//! learned MLP. Contributions sharing a voxel are summed.
//!
//! Output channels are polarity-major: negative bins `0..bins`, then
//! positive bins `bins..2*bins`.

use crate::error::EncoderError;
use crate::events::{Event, EventBatch};
use crate::nn::{Affine, Parameter, ParameterSet, leaky_relu, leaky_relu_grad};
use crate::optimizer::{Adam, Optimizer};
use crate::params::TIME_EPSILON;
use crate::precision::PrecisionMode;
use crate::tensor::Representation;
use rand::Rng;
use rayon::prelude::*;

/// Scalar MLP `v: R -> R` with leaky-ReLU hidden activations
#[derive(Clone, Debug)]
pub struct ValueLayer {
    layers: Vec<Affine>,
    slope: f32,
}

/// Activations of one forward evaluation, kept for the backward pass
#[derive(Clone, Debug)]
pub struct ValueScratch {
    inputs: Vec<Vec<f32>>,
    pre: Vec<Vec<f32>>,
    grad_in: Vec<Vec<f32>>,
    grad_pre: Vec<Vec<f32>>,
}

impl ValueLayer {
    /// `widths` lists layer sizes including the scalar input and output,
    /// e.g. `[1, 30, 30, 1]`
    pub fn new<R: Rng>(widths: &[usize], slope: f32, rng: &mut R) -> Self {
        debug_assert!(widths.len() >= 2 && widths[0] == 1 && widths[widths.len() - 1] == 1);
        let layers = widths
            .windows(2)
            .map(|w| {
                let mut layer = Affine::new(w[0], w[1]);
                layer.init_uniform(rng);
                layer
            })
            .collect();
        Self { layers, slope }
    }

    pub fn scratch(&self) -> ValueScratch {
        let inputs = self.layers.iter().map(|l| vec![0.0; l.input_dim()]).collect::<Vec<_>>();
        let pre = self.layers.iter().map(|l| vec![0.0; l.output_dim()]).collect::<Vec<_>>();
        ValueScratch { grad_in: inputs.clone(), grad_pre: pre.clone(), inputs, pre }
    }

    /// Evaluate `v(x)`, leaving activations in `scratch`
    pub fn forward(&self, x: f32, scratch: &mut ValueScratch, precision: PrecisionMode) -> f32 {
        let last = self.layers.len() - 1;
        scratch.inputs[0][0] = x;
        for (l, layer) in self.layers.iter().enumerate() {
            layer.forward(&scratch.inputs[l], &mut scratch.pre[l]);
            precision.round_slice(&mut scratch.pre[l]);
            if l < last {
                let (pre, next) = (&scratch.pre[l], &mut scratch.inputs[l + 1]);
                for (dst, &p) in next.iter_mut().zip(pre) {
                    *dst = precision.round(leaky_relu(p, self.slope));
                }
            }
        }
        scratch.pre[last][0]
    }

    /// Accumulate parameter gradients for `dL/dv = grad_out` at the point
    /// last evaluated into `scratch`
    pub fn backward(&mut self, scratch: &mut ValueScratch, grad_out: f32) {
        let last = self.layers.len() - 1;
        scratch.grad_pre[last][0] = grad_out;
        for l in (0..=last).rev() {
            self.layers[l].backward(&scratch.inputs[l], &scratch.grad_pre[l], &mut scratch.grad_in[l]);
            if l > 0 {
                let ValueScratch { pre, grad_in, grad_pre, .. } = &mut *scratch;
                for ((g, &gi), &p) in grad_pre[l - 1].iter_mut().zip(&grad_in[l]).zip(&pre[l - 1]) {
                    *g = gi * leaky_relu_grad(p, self.slope);
                }
            }
        }
    }

    /// Fit `v` to the trilinear kernel of `bins` bins by least squares on
    /// uniform samples from [-1, 1].
    ///
    /// Returns the summed squared error of the first and last step.
    pub fn init_trilinear<R: Rng>(
        &mut self,
        bins: usize,
        steps: usize,
        samples: usize,
        lr: f32,
        rng: &mut R,
    ) -> (f32, f32) {
        let mut optimizer = Adam::new(lr, PrecisionMode::Full);
        let mut scratch = self.scratch();
        let mut first = 0.0;
        let mut last = 0.0;
        for step in 0..steps {
            self.zero_grad();
            let mut loss = 0.0;
            for _ in 0..samples {
                let s = rng.random::<f32>() * 2.0 - 1.0;
                let target = trilinear_kernel(s, bins);
                let diff = self.forward(s, &mut scratch, PrecisionMode::Full) - target;
                loss += diff * diff;
                self.backward(&mut scratch, 2.0 * diff);
            }
            optimizer.step(&mut *self);
            if step == 0 {
                first = loss;
            }
            last = loss;
        }
        (first, last)
    }
}

impl ParameterSet for ValueLayer {
    fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit(&format!("mlp.{i}"), f);
        }
    }

    fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter)) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_mut(&format!("mlp.{i}"), f);
        }
    }
}

/// Triangle kernel of half-width `1/(bins-1)` centred at 0, peak 1
pub fn trilinear_kernel(s: f32, bins: usize) -> f32 {
    let scale = (bins.max(2) - 1) as f32;
    (1.0 - scale * s.abs()).max(0.0)
}

/// Quantization layer: event streams to a (B, 2·bins, H, W) tensor
#[derive(Clone, Debug)]
pub struct QuantizationLayer {
    bins: usize,
    height: usize,
    width: usize,
    value_layer: ValueLayer,
}

impl QuantizationLayer {
    pub fn new(bins: usize, height: usize, width: usize, value_layer: ValueLayer) -> Self {
        debug_assert!(bins >= 2);
        Self { bins, height, width, value_layer }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn channels(&self) -> usize {
        2 * self.bins
    }

    pub fn value_layer(&self) -> &ValueLayer {
        &self.value_layer
    }

    pub fn value_layer_mut(&mut self) -> &mut ValueLayer {
        &mut self.value_layer
    }

    /// Channel-plane offset of bin `bin` for an event, within one sample
    #[inline]
    fn voxel(&self, event: &Event, bin: usize) -> usize {
        let channel = event.polarity.index() * self.bins + bin;
        (channel * self.height + event.y as usize) * self.width + event.x as usize
    }

    fn check_bounds(&self, sample: usize, stream: &[Event]) -> Result<(), EncoderError> {
        match stream.iter().find(|e| e.x as usize >= self.width || e.y as usize >= self.height) {
            Some(e) => Err(EncoderError::EventOutOfBounds {
                sample,
                x: e.x,
                y: e.y,
                width: self.width,
                height: self.height,
            }),
            None => Ok(()),
        }
    }

    #[inline]
    fn bin_offset(&self, bin: usize) -> f32 {
        bin as f32 / (self.bins - 1) as f32
    }

    fn scatter_sample(
        &self,
        sample: usize,
        stream: &[Event],
        voxels: &mut [f32],
        precision: PrecisionMode,
    ) -> Result<(), EncoderError> {
        self.check_bounds(sample, stream)?;
        let scale = time_scale(stream);
        let mut scratch = self.value_layer.scratch();
        for event in stream {
            let t = precision.round(event.t / scale);
            for bin in 0..self.bins {
                let v = self.value_layer.forward(t - self.bin_offset(bin), &mut scratch, precision);
                let value = precision.round(t * v);
                let idx = self.voxel(event, bin);
                voxels[idx] = precision.round(voxels[idx] + value);
            }
        }
        Ok(())
    }

    /// Encode a batch. Samples are independent and processed in parallel.
    pub fn forward(&self, batch: &EventBatch, precision: PrecisionMode) -> Result<Representation, EncoderError> {
        let mut rep = Representation::zeros(batch.num_samples(), self.channels(), self.height, self.width);
        let sample_len = rep.sample_len();
        if sample_len == 0 {
            return Ok(rep);
        }
        rep.data_mut()
            .par_chunks_mut(sample_len)
            .enumerate()
            .try_for_each(|(b, voxels)| self.scatter_sample(b, batch.stream(b), voxels, precision))?;
        Ok(rep)
    }

    /// Accumulate value-layer gradients given `dL/d representation`
    pub fn backward(
        &mut self,
        batch: &EventBatch,
        grad: &Representation,
        precision: PrecisionMode,
    ) -> Result<(), EncoderError> {
        let expected = [batch.num_samples(), self.channels(), self.height, self.width];
        if grad.shape() != expected {
            return Err(EncoderError::GradientShape { expected, actual: grad.shape() });
        }
        let mut scratch = self.value_layer.scratch();
        for (b, stream) in batch.streams().enumerate() {
            self.check_bounds(b, stream)?;
            let sample_grad = grad.sample(b);
            let scale = time_scale(stream);
            for event in stream {
                let t = precision.round(event.t / scale);
                for bin in 0..self.bins {
                    let g = sample_grad[self.voxel(event, bin)];
                    if g == 0.0 {
                        continue;
                    }
                    let s = t - self.bin_offset(bin);
                    self.value_layer.forward(s, &mut scratch, precision);
                    self.value_layer.backward(&mut scratch, t * g);
                }
            }
        }
        Ok(())
    }
}

/// Per-sample timestamp normalizer, floored to avoid division by zero
fn time_scale(stream: &[Event]) -> f32 {
    stream.iter().map(|e| e.t).fold(f32::NEG_INFINITY, f32::max).max(TIME_EPSILON)
}

impl ParameterSet for QuantizationLayer {
    fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter)) {
        self.value_layer.for_each_parameter(&mut |name, p| f(&format!("value_layer.{name}"), p));
    }

    fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.value_layer.for_each_parameter_mut(&mut |name, p| f(&format!("value_layer.{name}"), p));
    }
}
