//! Classification head: global average pooling, two ReLU dense layers with
//! dropout, and the output layer.

use burn::{
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

#[derive(Module, Debug)]
pub struct FogHead<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout1: Dropout,
    pub fc2: Linear<B>,
    pub dropout2: Dropout,
    pub output: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> FogHead<B> {
    pub fn new(
        in_features: usize,
        hidden_units: [usize; 2],
        dropout: f64,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(in_features, hidden_units[0]).init(device),
            dropout1: DropoutConfig::new(dropout).init(),
            fc2: LinearConfig::new(hidden_units[0], hidden_units[1]).init(device),
            dropout2: DropoutConfig::new(dropout).init(),
            output: LinearConfig::new(hidden_units[1], num_classes).init(device),
            activation: Relu::new(),
        }
    }

    /// Feature map `[batch, channels, h, w]` to logits `[batch, num_classes]`
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let [batch, channels, _, _] = x.dims();
        let x: Tensor<B, 2> = x.reshape([batch, channels]);

        let x = self.dropout1.forward(self.activation.forward(self.fc1.forward(x)));
        let x = self.dropout2.forward(self.activation.forward(self.fc2.forward(x)));
        self.output.forward(x)
    }
}
