pub mod benchmark;
pub mod cancel;
pub mod clock;
pub mod domain;
pub mod errors;
pub mod harness;
pub mod traits;
pub mod verdict;
pub mod workspace;
