//! The `SandboxRuntime` capability.
//!
//! The real runtime (a container engine) lives outside this workspace;
//! everything in the core goes through this trait. [`InProcessRuntime`]
//! is the no-isolation stand-in used by tests and single-node dev mode.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use tb_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Specs and handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resource caps applied when creating a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCaps {
    pub memory_mib: u64,
    pub cpu: f64,
    /// Sandboxes get no network unless explicitly enabled.
    pub network_enabled: bool,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            memory_mib: 512,
            cpu: 0.5,
            network_enabled: false,
        }
    }
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub image: String,
    /// Override for the image entrypoint, if any.
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub caps: ResourceCaps,
}

/// Output of an exec inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Duplex stdio attached to a sandbox's main process.
///
/// The read side carries the runtime's multiplexed framing (8-byte
/// headers); the sandbox-stdio transport demultiplexes it.
pub struct AttachedStreams {
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capability for creating and driving sandboxed processes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a sandbox; returns its opaque id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;

    /// Stop and remove a sandbox. Idempotent.
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;

    /// Run a command inside a running sandbox (workspace cleanup etc.).
    async fn exec(&self, sandbox_id: &str, command: &[String]) -> Result<ExecOutput>;

    /// Attach to the sandbox's main-process stdio.
    async fn attach(&self, sandbox_id: &str) -> Result<AttachedStreams>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type AttachmentFactory = dyn Fn() -> AttachedStreams + Send + Sync;

#[derive(Debug, Clone)]
struct FakeSandbox {
    spec: SandboxSpec,
    /// Commands exec'd in this sandbox, newest last.
    exec_log: Vec<Vec<String>>,
}

/// In-process [`SandboxRuntime`] with no actual isolation.
///
/// Tracks created sandboxes, their specs, and exec history; tests can
/// install an attachment factory to wire stdio to a scripted peer.
pub struct InProcessRuntime {
    sandboxes: Mutex<HashMap<String, FakeSandbox>>,
    attachment_factory: Mutex<Option<Arc<AttachmentFactory>>>,
    created: Mutex<u64>,
}

impl Default for InProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            attachment_factory: Mutex::new(None),
            created: Mutex::new(0),
        }
    }

    /// Install the factory used by [`SandboxRuntime::attach`].
    pub fn set_attachment_factory(
        &self,
        factory: impl Fn() -> AttachedStreams + Send + Sync + 'static,
    ) {
        *self.attachment_factory.lock() = Some(Arc::new(factory));
    }

    /// Total sandboxes ever created (for test assertions).
    pub fn created_count(&self) -> u64 {
        *self.created.lock()
    }

    /// Number of currently live sandboxes.
    pub fn live_count(&self) -> usize {
        self.sandboxes.lock().len()
    }

    /// The spec a live sandbox was created with.
    pub fn spec_of(&self, sandbox_id: &str) -> Option<SandboxSpec> {
        self.sandboxes.lock().get(sandbox_id).map(|s| s.spec.clone())
    }

    /// Exec history of a live sandbox.
    pub fn exec_log(&self, sandbox_id: &str) -> Vec<Vec<String>> {
        self.sandboxes
            .lock()
            .get(sandbox_id)
            .map(|s| s.exec_log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxRuntime for InProcessRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let sandbox_id = format!("sbx-{}", uuid::Uuid::new_v4());
        self.sandboxes.lock().insert(
            sandbox_id.clone(),
            FakeSandbox {
                spec: spec.clone(),
                exec_log: Vec::new(),
            },
        );
        *self.created.lock() += 1;
        tracing::debug!(sandbox_id = %sandbox_id, image = %spec.image, "created in-process sandbox");
        Ok(sandbox_id)
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        self.sandboxes.lock().remove(sandbox_id);
        Ok(())
    }

    async fn exec(&self, sandbox_id: &str, command: &[String]) -> Result<ExecOutput> {
        let mut sandboxes = self.sandboxes.lock();
        let sandbox = sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| Error::NotFound(format!("no such sandbox: {sandbox_id}")))?;
        sandbox.exec_log.push(command.to_vec());
        Ok(ExecOutput::default())
    }

    async fn attach(&self, sandbox_id: &str) -> Result<AttachedStreams> {
        if !self.sandboxes.lock().contains_key(sandbox_id) {
            return Err(Error::NotFound(format!("no such sandbox: {sandbox_id}")));
        }
        let factory = self.attachment_factory.lock().clone();
        match factory {
            Some(factory) => Ok(factory()),
            None => {
                // Closed duplex: reads see EOF immediately.
                let (_near, far) = tokio::io::duplex(1);
                let (read_half, write_half) = tokio::io::split(far);
                Ok(AttachedStreams {
                    writer: Box::new(write_half),
                    reader: Box::new(read_half),
                })
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps() {
        let caps = ResourceCaps::default();
        assert_eq!(caps.memory_mib, 512);
        assert_eq!(caps.cpu, 0.5);
        assert!(!caps.network_enabled);
    }

    #[tokio::test]
    async fn create_exec_destroy() {
        let runtime = InProcessRuntime::new();
        let spec = SandboxSpec {
            image: "tool-srv:1".into(),
            ..Default::default()
        };
        let id = runtime.create(&spec).await.unwrap();
        assert_eq!(runtime.live_count(), 1);
        assert_eq!(runtime.spec_of(&id).unwrap().image, "tool-srv:1");

        runtime
            .exec(&id, &["rm".into(), "-rf".into(), "/workspace".into()])
            .await
            .unwrap();
        assert_eq!(runtime.exec_log(&id).len(), 1);

        runtime.destroy(&id).await.unwrap();
        assert_eq!(runtime.live_count(), 0);
        // Destroy is idempotent.
        runtime.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn exec_on_missing_sandbox_fails() {
        let runtime = InProcessRuntime::new();
        let err = runtime.exec("ghost", &["true".into()]).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
