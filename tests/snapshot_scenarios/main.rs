//! End-to-end snapshot scenarios through the `cowsnap` facade

mod common;

mod basic_cow;
mod deletion;
mod exclusion;
mod invariants;
mod logging;
mod persistence;
mod strategies;
