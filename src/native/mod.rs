/// Native module contains implementations of core traits
/// without using any external dependencies like Docker or Runc,
/// using syscalls and `/proc` directly instead.
pub mod cgroup;
pub mod compiler;
pub mod procfs;
pub mod runner;
pub mod sandbox;
