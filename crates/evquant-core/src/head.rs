//! Classifier head: adaptive average pooling, then a two-layer perceptron.

use crate::nn::{Affine, Parameter, ParameterSet, leaky_relu, leaky_relu_grad};
use crate::precision::PrecisionMode;
use crate::tensor::{Logits, Representation};
use rand::Rng;

/// Half-open input range covered by output cell `i` of an adaptive pool
#[inline]
fn adaptive_bounds(i: usize, input: usize, output: usize) -> (usize, usize) {
    let start = i * input / output;
    let end = ((i + 1) * input).div_ceil(output);
    (start, end)
}

/// Intermediate activations needed by [`ClassifierHead::backward`]
#[derive(Clone, Debug, Default)]
pub struct HeadCache {
    pooled: Vec<f32>,
    hidden_pre: Vec<f32>,
    hidden: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct ClassifierHead {
    channels: usize,
    grid: usize,
    slope: f32,
    hidden: Affine,
    fc: Affine,
}

impl ClassifierHead {
    pub fn new<R: Rng>(
        channels: usize,
        grid: usize,
        hidden: usize,
        num_classes: usize,
        slope: f32,
        rng: &mut R,
    ) -> Self {
        let mut hidden_layer = Affine::new(channels * grid * grid, hidden);
        hidden_layer.init_uniform(rng);
        let mut fc = Affine::new(hidden, num_classes);
        fc.init_uniform(rng);
        Self { channels, grid, slope, hidden: hidden_layer, fc }
    }

    pub fn num_classes(&self) -> usize {
        self.fc.output_dim()
    }

    fn features(&self) -> usize {
        self.channels * self.grid * self.grid
    }

    fn pool_sample(&self, rep: &Representation, b: usize, out: &mut [f32]) {
        let (h, w, g) = (rep.height(), rep.width(), self.grid);
        for c in 0..self.channels {
            for gy in 0..g {
                let (y0, y1) = adaptive_bounds(gy, h, g);
                for gx in 0..g {
                    let (x0, x1) = adaptive_bounds(gx, w, g);
                    let mut sum = 0.0;
                    for y in y0..y1 {
                        let row = rep.offset(b, c, y, 0);
                        sum += rep.data()[row + x0..row + x1].iter().sum::<f32>();
                    }
                    out[(c * g + gy) * g + gx] = sum / ((y1 - y0) * (x1 - x0)) as f32;
                }
            }
        }
    }

    pub fn forward(&self, rep: &Representation, precision: PrecisionMode) -> (Logits, HeadCache) {
        debug_assert_eq!(rep.channels(), self.channels);
        let batch = rep.batch();
        let (features, hidden_dim, classes) = (self.features(), self.hidden.output_dim(), self.num_classes());
        let mut cache = HeadCache {
            pooled: vec![0.0; batch * features],
            hidden_pre: vec![0.0; batch * hidden_dim],
            hidden: vec![0.0; batch * hidden_dim],
        };
        let mut logits = Logits::zeros(batch, classes);
        for b in 0..batch {
            let pooled = &mut cache.pooled[b * features..(b + 1) * features];
            self.pool_sample(rep, b, pooled);
            precision.round_slice(pooled);

            let pre = &mut cache.hidden_pre[b * hidden_dim..(b + 1) * hidden_dim];
            self.hidden.forward(pooled, pre);
            precision.round_slice(pre);

            let act = &mut cache.hidden[b * hidden_dim..(b + 1) * hidden_dim];
            for (a, &p) in act.iter_mut().zip(pre.iter()) {
                *a = precision.round(leaky_relu(p, self.slope));
            }

            let out = logits.row_mut(b);
            self.fc.forward(act, out);
            precision.round_slice(out);
        }
        (logits, cache)
    }

    /// Accumulate head gradients and return `dL/d representation`
    pub fn backward(&mut self, shape: [usize; 4], cache: &HeadCache, grad_logits: &Logits) -> Representation {
        let [batch, channels, h, w] = shape;
        let (features, hidden_dim, g) = (self.features(), self.hidden.output_dim(), self.grid);
        let mut grad_rep = Representation::zeros(batch, channels, h, w);
        let mut grad_hidden = vec![0.0; hidden_dim];
        let mut grad_pre = vec![0.0; hidden_dim];
        let mut grad_pooled = vec![0.0; features];

        for b in 0..batch {
            let act = &cache.hidden[b * hidden_dim..(b + 1) * hidden_dim];
            self.fc.backward(act, grad_logits.row(b), &mut grad_hidden);

            let pre = &cache.hidden_pre[b * hidden_dim..(b + 1) * hidden_dim];
            for ((gp, &gh), &p) in grad_pre.iter_mut().zip(&grad_hidden).zip(pre) {
                *gp = gh * leaky_relu_grad(p, self.slope);
            }

            let pooled = &cache.pooled[b * features..(b + 1) * features];
            self.hidden.backward(pooled, &grad_pre, &mut grad_pooled);

            for c in 0..channels {
                for gy in 0..g {
                    let (y0, y1) = adaptive_bounds(gy, h, g);
                    for gx in 0..g {
                        let (x0, x1) = adaptive_bounds(gx, w, g);
                        let share = grad_pooled[(c * g + gy) * g + gx] / ((y1 - y0) * (x1 - x0)) as f32;
                        for y in y0..y1 {
                            let row = grad_rep.offset(b, c, y, 0);
                            for v in &mut grad_rep.data_mut()[row + x0..row + x1] {
                                *v += share;
                            }
                        }
                    }
                }
            }
        }
        grad_rep
    }
}

impl ParameterSet for ClassifierHead {
    fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter)) {
        self.hidden.visit("hidden", f);
        self.fc.visit("fc", f);
    }

    fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.hidden.visit_mut("hidden", f);
        self.fc.visit_mut("fc", f);
    }
}
