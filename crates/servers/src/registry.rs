//! File-backed tool-server registry.
//!
//! Owns the `tool-servers.json` document: load, validate, mutate, and
//! persist (write-temp-then-rename). Two copies are kept in memory: the
//! raw document as persisted (placeholders intact) and the resolved one
//! with `${NAME}` environment placeholders substituted. Consumers read
//! the resolved copy; saves write the raw copy so round-trips preserve
//! the operator's file.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use tb_domain::config::{
    is_valid_server_name, RegistryDocument, RegistrySettings, ToolServerConfig, TransportConfig,
};
use tb_domain::event::RegistryEvent;
use tb_domain::{Error, Result};

const EVENT_CAPACITY: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment placeholder substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Substitute `${NAME}` placeholders in every string of `value`.
///
/// Unresolved placeholders are left intact and warned about; a missing
/// variable is an operator hint, not a startup failure.
pub fn interpolate_placeholders(value: &mut Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = substitute(s, lookup);
            }
        }
        Value::Array(items) => {
            for item in items {
                interpolate_placeholders(item, lookup);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_placeholders(item, lookup);
            }
        }
        _ => {}
    }
}

fn substitute(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(resolved) => out.push_str(&resolved),
                    None => {
                        tracing::warn!(placeholder = name, "unresolved environment placeholder");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder; keep the remainder verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate one server entry: name pattern plus transport-required fields.
pub fn validate_server(name: &str, config: &ToolServerConfig) -> Result<()> {
    if !is_valid_server_name(name) {
        return Err(Error::Validation(format!(
            "invalid server name {name:?}: must match [A-Za-z0-9_-]+"
        )));
    }
    match &config.transport {
        TransportConfig::SandboxStdio { container_image, .. } => {
            if container_image.is_empty() {
                return Err(Error::Validation(format!(
                    "server {name:?}: containerImage is required for sandbox-stdio"
                )));
            }
        }
        TransportConfig::LocalStdio { command, .. } => {
            if command.is_empty() {
                return Err(Error::Validation(format!(
                    "server {name:?}: command is required for local-stdio"
                )));
            }
        }
        TransportConfig::Http { url, .. } | TransportConfig::Sse { url, .. } => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Validation(format!(
                    "server {name:?}: url must be an http(s) URL, got {url:?}"
                )));
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Docs {
    /// As persisted on disk, placeholders intact.
    raw: RegistryDocument,
    /// With environment placeholders substituted.
    resolved: RegistryDocument,
}

pub struct ToolServerRegistry {
    path: PathBuf,
    docs: RwLock<Docs>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ToolServerRegistry {
    /// Load the registry from `path`, or start empty when the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let doc: RegistryDocument = serde_json::from_str(&text)
                .map_err(|e| Error::Validation(format!("malformed registry document: {e}")))?;
            doc
        } else {
            tracing::info!(path = %path.display(), "no registry file, starting empty");
            RegistryDocument::default()
        };

        for (name, config) in &raw.servers {
            validate_server(name, config)?;
        }

        let resolved = resolve_document(&raw)?;
        tracing::info!(
            path = %path.display(),
            servers = raw.servers.len(),
            "tool server registry loaded"
        );

        Ok(Self {
            path,
            docs: RwLock::new(Docs { raw, resolved }),
            events: broadcast::channel(EVENT_CAPACITY).0,
        })
    }

    /// Subscribe to configuration change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<ToolServerConfig> {
        self.docs.read().resolved.servers.get(name).cloned()
    }

    /// Enabled servers in deterministic (name) order, resolved.
    pub fn list_enabled(&self) -> Vec<(String, ToolServerConfig)> {
        self.docs
            .read()
            .resolved
            .servers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect()
    }

    /// All servers (enabled or not), resolved, in name order.
    pub fn list_all(&self) -> Vec<(String, ToolServerConfig)> {
        self.docs
            .read()
            .resolved
            .servers
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect()
    }

    pub fn settings(&self) -> RegistrySettings {
        self.docs.read().resolved.settings.clone()
    }

    /// Add a new server. Fails with `Conflict` when the name is taken.
    pub fn add(&self, name: &str, config: ToolServerConfig) -> Result<()> {
        validate_server(name, &config)?;
        {
            let mut docs = self.docs.write();
            if docs.raw.servers.contains_key(name) {
                return Err(Error::Conflict(format!("server {name:?} already exists")));
            }
            docs.raw.servers.insert(name.to_owned(), config);
            self.commit(&mut docs)?;
        }
        self.emit(RegistryEvent::Added { name: name.to_owned() });
        Ok(())
    }

    /// Remove a server. Fails with `NotFound` for unknown names.
    pub fn remove(&self, name: &str) -> Result<()> {
        {
            let mut docs = self.docs.write();
            if docs.raw.servers.remove(name).is_none() {
                return Err(Error::NotFound(format!("no such server: {name}")));
            }
            self.commit(&mut docs)?;
        }
        self.emit(RegistryEvent::Removed { name: name.to_owned() });
        Ok(())
    }

    /// Replace a server's configuration in place.
    pub fn update(&self, name: &str, config: ToolServerConfig) -> Result<()> {
        validate_server(name, &config)?;
        {
            let mut docs = self.docs.write();
            if !docs.raw.servers.contains_key(name) {
                return Err(Error::NotFound(format!("no such server: {name}")));
            }
            docs.raw.servers.insert(name.to_owned(), config);
            self.commit(&mut docs)?;
        }
        self.emit(RegistryEvent::Updated { name: name.to_owned() });
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        {
            let mut docs = self.docs.write();
            let server = docs
                .raw
                .servers
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("no such server: {name}")))?;
            if server.enabled == enabled {
                return Ok(());
            }
            server.enabled = enabled;
            self.commit(&mut docs)?;
        }
        self.emit(if enabled {
            RegistryEvent::Enabled { name: name.to_owned() }
        } else {
            RegistryEvent::Disabled { name: name.to_owned() }
        });
        Ok(())
    }

    pub fn update_settings(&self, settings: RegistrySettings) -> Result<()> {
        {
            let mut docs = self.docs.write();
            docs.raw.settings = settings;
            self.commit(&mut docs)?;
        }
        self.emit(RegistryEvent::Settings);
        Ok(())
    }

    /// Re-read the document from disk, re-substituting placeholders.
    pub fn reload(&self) -> Result<()> {
        let text = std::fs::read_to_string(&self.path)?;
        let raw: RegistryDocument = serde_json::from_str(&text)
            .map_err(|e| Error::Validation(format!("malformed registry document: {e}")))?;
        for (name, config) in &raw.servers {
            validate_server(name, config)?;
        }
        let resolved = resolve_document(&raw)?;
        {
            let mut docs = self.docs.write();
            *docs = Docs { raw, resolved };
        }
        self.emit(RegistryEvent::Reloaded);
        Ok(())
    }

    /// Snapshot of the raw (persisted-form) document.
    pub fn raw_document(&self) -> RegistryDocument {
        self.docs.read().raw.clone()
    }

    /// Persist the raw document transactionally and refresh the resolved
    /// copy. Called with the write lock held.
    fn commit(&self, docs: &mut Docs) -> Result<()> {
        docs.resolved = resolve_document(&docs.raw)?;

        let text = serde_json::to_string_pretty(&docs.raw)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

fn resolve_document(raw: &RegistryDocument) -> Result<RegistryDocument> {
    let mut value = serde_json::to_value(raw)?;
    interpolate_placeholders(&mut value, &|name| std::env::var(name).ok());
    let resolved = serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("registry document after substitution: {e}")))?;
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
