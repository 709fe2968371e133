//! Production (tokio-backed) implementation of `common::runtime::Runtime`.

pub mod prod;
pub mod testing;

pub use prod::ProdRuntime;
