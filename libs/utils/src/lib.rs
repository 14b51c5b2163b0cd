//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.
#![deny(clippy::undocumented_unsafe_blocks)]

// helper functions for creating and fsyncing
pub mod crashsafe;

pub mod fs_ext;

// common log initialisation routine
pub mod logging;

// child processes and the external utilities we drive through them
pub mod exec;
pub mod rsync;
pub mod ssh;

pub mod daemon;
