//! Shared utility functions for ml-forge.
//!
//! JSON extraction from LLM responses and sandbox output, plus small text
//! helpers for generated code.

pub mod json_extraction;
pub mod text;

pub use json_extraction::{
    extract_json_object, extract_last_valid_json_object, find_matching_brace,
    parse_last_json_line,
};
pub use text::{clean_code_block, truncate_chars};
