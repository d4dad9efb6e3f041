//! Configuration module

mod image;

pub use image::*;
