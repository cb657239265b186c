pub mod checkpoint;
pub mod config;
pub mod error;
pub mod generator;
pub mod hyena;
pub mod parity;
pub mod sampling;
pub mod state;
pub mod tokenizer;
pub mod utils;

#[macro_use]
extern crate shrinkwraprs;
