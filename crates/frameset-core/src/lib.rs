mod hash;
mod manifest;
mod pattern;

pub use hash::{sha256_hex, sha256_hex_file, ContentHash};
pub use manifest::{validate_relative_path, Component, Manifest};
pub use pattern::{select_files, Pattern, PatternSet};

#[cfg(test)]
mod tests;
