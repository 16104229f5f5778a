pub mod convert;
pub mod middleware;
pub mod stream2nostream;
