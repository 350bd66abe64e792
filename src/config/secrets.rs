//! Secret handling utilities.
//!
//! Re-exports secrecy types for working with secrets in the auditq
//! context.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
