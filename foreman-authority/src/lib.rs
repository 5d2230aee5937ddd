//! # foreman-authority
//!
//! The worker authority ("forkserver"): the single component with the
//! capability to create and terminate worker processes. Spawn requests are
//! serialized through one actor; workers are cloned from a
//! [`SpawnTemplate`] carrying the shared execution environment and a
//! pinned config snapshot version.

pub mod authority;
pub mod error;
pub mod spawner;
pub mod template;

pub use authority::{AuthorityConfig, AuthorityHandle, WorkerAuthority};
pub use error::{AuthorityError, SpawnError};
pub use spawner::{ExitOutcome, LocalSpawner, ProcessHandle, SpawnRequest, Spawner};
pub use template::{
    SpawnTemplate, ENV_SINK_SOCKET, ENV_SNAPSHOT_PATH, ENV_SNAPSHOT_VERSION, ENV_STORE_SOCKET,
    ENV_TASKS_SOCKET, ENV_WORKER_ID,
};
