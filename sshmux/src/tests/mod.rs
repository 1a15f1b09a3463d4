#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)] // Allow unwraps, expects, panics and indexing in the test suite

mod channels;
mod parsing;
