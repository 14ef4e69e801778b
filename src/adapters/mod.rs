//! Adapters implementing the domain ports (§6) against real or in-memory
//! backends.

pub mod fakes;
pub mod memory_storage;
pub mod process_launcher_tokio;
pub mod worktree_manager_git;

pub use fakes::{FakeProcessLauncher, FakeWorktreeManager};
pub use memory_storage::MemoryStorage;
pub use process_launcher_tokio::TokioProcessLauncher;
pub use worktree_manager_git::GitWorktreeManager;
