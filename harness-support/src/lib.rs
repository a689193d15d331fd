//! Low-level, domain-agnostic utilities shared by the harness core.
//!
//! This crate knows nothing about tasks, sandboxes, or agents. It provides
//! fuzzy-matching of text blocks when an exact patch match fails.

#![allow(clippy::uninlined_format_args)]

pub mod patch;

pub use patch::{
    HunkResult, MatchKind, PatchConfig, PatchEngine, PatchHunk, PatchResult,
};
