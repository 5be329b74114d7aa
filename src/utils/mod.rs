//! The `utils` module holds the pieces shared by every other module: the
//! session error type and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{Result, SessionError};

#[cfg(test)]
mod tests;
