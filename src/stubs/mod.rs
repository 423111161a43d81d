//! Delay-based stand-ins for the compiler and runner, used to exercise orchestration,
//! cancellation and concurrency without a toolchain.
pub mod compiler;
pub mod runner;
