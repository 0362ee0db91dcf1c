//! Pure utility functions

pub mod title;
