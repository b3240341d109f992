pub mod runtime;
pub mod signal;
