//! Strata CLI - build, tag and inspect layered images.

pub mod commands;
pub mod output;
