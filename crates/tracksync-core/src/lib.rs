pub mod config;
pub mod error;
pub mod flow;
pub mod model;
pub mod storage;
pub mod template;
pub mod tracker;
pub mod vars;

pub use error::{Error, Result};
