//! Persisted state layout.
//!
//! Every key the core writes is built here so the layout stays greppable:
//!
//! - `session:<id>` — session record JSON
//! - `session:index` — sorted set, score = lastActive, member = session id
//! - `session:lock:<id>` — single-flight lock, PX TTL
//! - `conv:<id>` — message log list
//! - `jobs:queue` — dispatch-plane FIFO
//! - `results:<id>` — per-session result channel

pub const SESSION_INDEX: &str = "session:index";
pub const JOBS_QUEUE: &str = "jobs:queue";

pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn session_lock(session_id: &str) -> String {
    format!("session:lock:{session_id}")
}

pub fn conversation(session_id: &str) -> String {
    format!("conv:{session_id}")
}

pub fn results_channel(session_id: &str) -> String {
    format!("results:{session_id}")
}
