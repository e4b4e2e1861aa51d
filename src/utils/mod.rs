//! The `utils` module holds the pieces shared by the whole crate: the error
//! type and logging setup.

pub mod error;
pub mod logging;
