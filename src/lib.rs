//! A minimal library for training feed-forward networks on handwritten digits
//! using a PyTorch-like API.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod plot;
pub mod tensor;
pub mod trainer;
pub mod walkthrough;
