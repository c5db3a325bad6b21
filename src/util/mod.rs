//! Utility functions
//!
//! Pure helpers - time formatting, retry jitter.

pub mod rand;
pub mod time;
