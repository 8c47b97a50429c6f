pub use activation_layer::ActivationLayer;
pub use batch_norm_layer::BatchNormLayer;
pub use dense_layer::DenseLayer;
pub use grid_pooling_layer::GridPoolingLayer;

mod activation_layer;
mod batch_norm_layer;
mod dense_layer;
mod grid_pooling_layer;
