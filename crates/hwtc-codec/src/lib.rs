#![doc = include_str!("../README.md")]

pub mod buffer_pool;
pub mod config;
pub mod dynamic_rc;
pub mod keyframes;
pub mod reference;
pub mod session;
pub mod validate;
