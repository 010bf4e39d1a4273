//! Helpers shared across modules.

pub mod json;

pub use json::{merge_diff, merge_patch};
