//! Architecture support
//!
//! Duovisor targets AArch64 only. The `arm64` modules expose real
//! hardware paths when built for `aarch64-unknown-none` and inert
//! host-side fallbacks everywhere else, so the unit-test suite runs on
//! the build machine.

pub mod arm64;

pub use arm64::cpu;
