//! Tests for the raw server







#[cfg(test)]
mod integration_tests;
