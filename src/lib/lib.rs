//! A tree rewriting virtual machine
//!
//! Programs compiled from a grammar run here: they build reference counted,
//! copy on write trees, drive incremental backtracking LR parsers over token
//! trees, and record typed reverse code so that speculative grammar actions
//! can be undone when the parser backtracks

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pool;
pub mod arena;
pub mod tree;
pub mod vm;
pub mod parse;

pub use self::{
  config::Config,
  error::{ VmError, VmResult },
  vm::{ Program, Teardown },
};
