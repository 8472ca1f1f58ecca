//! `utils` is intended to be a place to put code that is shared
//! between the other crates in this repository.

// helper functions for creating and fsyncing directories and files
pub mod crashsafe;

// extensions to `std::fs` types
pub mod fs_ext;
