//! Succinct encodings used by the file formats.

mod elias_fano;

pub use elias_fano::*;
