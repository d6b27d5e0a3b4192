#![doc = include_str!("../README.md")]

pub mod decode_thread;
pub mod file_sink;
pub mod filter_chain;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod stages;
pub mod sync;
pub mod synthetic;
pub mod transfer;
