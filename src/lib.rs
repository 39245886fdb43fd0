pub mod error;
pub mod config;
pub mod frame;
pub mod background_model;
pub mod segmentation;
pub mod normalizer;
pub mod source;
pub mod compositor;
pub mod sink;
pub mod pipeline;
pub mod cli;
