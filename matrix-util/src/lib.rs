/// gzip-aware line readers and writers
pub mod common_io;

/// dense `nalgebra` matrix routines: column normalization, logs,
/// gamma/Dirichlet column sampling
pub mod dmatrix_util;

/// minibatch scheduling helpers
pub mod utils;

pub use nalgebra::{DMatrix, DVector};

/// dense matrix type shared across the workspace
pub type Mat = DMatrix<f32>;
