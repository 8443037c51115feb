//! The trainable classifier: quantization layer followed by the head.

use crate::config::ModelConfig;
use crate::encoder::{QuantizationLayer, ValueLayer};
use crate::error::Result;
use crate::events::EventBatch;
use crate::head::{ClassifierHead, HeadCache};
use crate::nn::{Parameter, ParameterSet};
use crate::precision::PrecisionMode;
use crate::tensor::{Logits, Representation};
use rand::Rng;

/// Result of one forward pass
#[derive(Clone, Debug)]
pub struct ForwardOutput<C> {
    pub logits: Logits,
    /// Encoder output, kept for visualization
    pub representation: Representation,
    /// Model-specific activations for the backward pass
    pub cache: C,
}

/// A model the training controller can drive.
///
/// `forward` must not mutate parameters; `backward` accumulates gradients
/// into them for the optimizer to consume.
pub trait EventClassifier: ParameterSet {
    type Cache;

    fn num_classes(&self) -> usize;

    fn forward(&self, batch: &EventBatch, precision: PrecisionMode) -> Result<ForwardOutput<Self::Cache>>;

    fn backward(
        &mut self,
        batch: &EventBatch,
        output: &ForwardOutput<Self::Cache>,
        grad_logits: &Logits,
        precision: PrecisionMode,
    ) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct QuantizedClassifier {
    quantization_layer: QuantizationLayer,
    classifier: ClassifierHead,
}

impl QuantizedClassifier {
    pub fn new<R: Rng>(config: &ModelConfig, num_classes: usize, rng: &mut R) -> Self {
        let value_layer = ValueLayer::new(&config.value_layer_widths, config.leaky_slope, rng);
        let quantization_layer = QuantizationLayer::new(config.bins, config.height, config.width, value_layer);
        let classifier = ClassifierHead::new(
            quantization_layer.channels(),
            config.pooled_grid,
            config.head_hidden,
            num_classes,
            config.leaky_slope,
            rng,
        );
        Self { quantization_layer, classifier }
    }

    /// Fit the value layer to the trilinear kernel before training starts
    pub fn init_kernel<R: Rng>(&mut self, config: &ModelConfig, rng: &mut R) -> (f32, f32) {
        let (first, last) = self.quantization_layer.value_layer_mut().init_trilinear(
            config.bins,
            config.kernel_init_steps,
            config.kernel_init_samples,
            config.kernel_init_lr,
            rng,
        );
        log::info!("Value layer kernel fit: squared error {first:.4} -> {last:.4}");
        (first, last)
    }

    pub fn quantization_layer(&self) -> &QuantizationLayer {
        &self.quantization_layer
    }
}

impl ParameterSet for QuantizedClassifier {
    fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter)) {
        self.quantization_layer.for_each_parameter(&mut |name, p| f(&format!("quantization_layer.{name}"), p));
        self.classifier.for_each_parameter(&mut |name, p| f(&format!("classifier.{name}"), p));
    }

    fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.quantization_layer
            .for_each_parameter_mut(&mut |name, p| f(&format!("quantization_layer.{name}"), p));
        self.classifier.for_each_parameter_mut(&mut |name, p| f(&format!("classifier.{name}"), p));
    }
}

impl EventClassifier for QuantizedClassifier {
    type Cache = HeadCache;

    fn num_classes(&self) -> usize {
        self.classifier.num_classes()
    }

    fn forward(&self, batch: &EventBatch, precision: PrecisionMode) -> Result<ForwardOutput<HeadCache>> {
        let representation = self.quantization_layer.forward(batch, precision)?;
        let (logits, cache) = self.classifier.forward(&representation, precision);
        Ok(ForwardOutput { logits, representation, cache })
    }

    fn backward(
        &mut self,
        batch: &EventBatch,
        output: &ForwardOutput<HeadCache>,
        grad_logits: &Logits,
        precision: PrecisionMode,
    ) -> Result<()> {
        let grad_rep = self.classifier.backward(output.representation.shape(), &output.cache, grad_logits);
        self.quantization_layer.backward(batch, &grad_rep, precision)?;
        Ok(())
    }
}
