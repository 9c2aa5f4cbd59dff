mod error;

pub use error::{Result, TsfError};
