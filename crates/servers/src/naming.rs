//! Deterministic tool-name resolution.
//!
//! Maps `(server, originalName)` pairs to the globally exposed catalog
//! and routes exposed names back to their owning server. Pure functions;
//! the connection manager feeds them its live catalog.

use std::collections::HashMap;

use tb_domain::config::NamespacingStrategy;
use tb_domain::tool::{ExposedTool, ToolDescriptor};

/// One server's contribution to the catalog, in registration order.
#[derive(Debug, Clone)]
pub struct ServerTools {
    pub server_name: String,
    /// Optional prefix override; defaults to the server name.
    pub tool_prefix: Option<String>,
    pub tools: Vec<ToolDescriptor>,
}

impl ServerTools {
    fn prefix(&self) -> &str {
        self.tool_prefix.as_deref().unwrap_or(&self.server_name)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the exposed catalog for the given strategy.
///
/// - `prefix`: every name becomes `{prefix}_{original}`.
/// - `none`: raw names; on cross-server collision the last-registered
///   server wins.
/// - `auto`: prefix whenever more than one server is enabled or a name
///   collides across servers; raw otherwise.
pub fn resolve_names(strategy: NamespacingStrategy, servers: &[ServerTools]) -> Vec<ExposedTool> {
    match strategy {
        NamespacingStrategy::Prefix => prefixed_catalog(servers),
        NamespacingStrategy::None => raw_catalog(servers),
        NamespacingStrategy::Auto => {
            let mut name_owners: HashMap<&str, usize> = HashMap::new();
            for server in servers {
                for tool in &server.tools {
                    *name_owners.entry(tool.original_name.as_str()).or_default() += 1;
                }
            }
            let needs_prefix = |tool: &ToolDescriptor| {
                servers.len() > 1 || name_owners.get(tool.original_name.as_str()).copied().unwrap_or(0) > 1
            };

            let mut catalog = Vec::new();
            for server in servers {
                for tool in &server.tools {
                    let exposed_name = if needs_prefix(tool) {
                        format!("{}_{}", server.prefix(), tool.original_name)
                    } else {
                        tool.original_name.clone()
                    };
                    catalog.push(ExposedTool {
                        exposed_name,
                        descriptor: tool.clone(),
                    });
                }
            }
            catalog
        }
    }
}

fn prefixed_catalog(servers: &[ServerTools]) -> Vec<ExposedTool> {
    servers
        .iter()
        .flat_map(|server| {
            server.tools.iter().map(move |tool| ExposedTool {
                exposed_name: format!("{}_{}", server.prefix(), tool.original_name),
                descriptor: tool.clone(),
            })
        })
        .collect()
}

fn raw_catalog(servers: &[ServerTools]) -> Vec<ExposedTool> {
    // Later registrations override earlier ones on collision.
    let mut by_name: HashMap<String, ExposedTool> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for server in servers {
        for tool in &server.tools {
            let exposed = ExposedTool {
                exposed_name: tool.original_name.clone(),
                descriptor: tool.clone(),
            };
            if by_name.insert(tool.original_name.clone(), exposed).is_none() {
                order.push(tool.original_name.clone());
            }
        }
    }
    order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve an exposed name to `(server, original name)`.
///
/// Resolution order: prefix match against a server that advertises the
/// stripped name, then exact original-name match, then a
/// separator-tolerant comparison (models commonly confuse `-` and `_`).
pub fn route<'a>(servers: &'a [ServerTools], exposed_name: &str) -> Option<(&'a str, String)> {
    // 1. Prefix match.
    for server in servers {
        let prefix = format!("{}_", server.prefix());
        if let Some(original) = exposed_name.strip_prefix(&prefix) {
            if server.tools.iter().any(|t| t.original_name == original) {
                return Some((server.server_name.as_str(), original.to_owned()));
            }
        }
    }

    // 2. Exact original-name match.
    for server in servers {
        if server.tools.iter().any(|t| t.original_name == exposed_name) {
            return Some((server.server_name.as_str(), exposed_name.to_owned()));
        }
    }

    // 3. Separator-mangling fallback.
    let wanted = normalize_separators(exposed_name);
    for server in servers {
        for tool in &server.tools {
            let prefixed = format!("{}_{}", server.prefix(), tool.original_name);
            if normalize_separators(&tool.original_name) == wanted
                || normalize_separators(&prefixed) == wanted
            {
                return Some((server.server_name.as_str(), tool.original_name.clone()));
            }
        }
    }

    None
}

fn normalize_separators(name: &str) -> String {
    name.replace('-', "_")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tb_domain::tool::empty_object_schema;

    fn descriptor(server: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            server_name: server.into(),
            original_name: name.into(),
            description: String::new(),
            parameters: empty_object_schema(),
        }
    }

    fn server(name: &str, prefix: Option<&str>, tools: &[&str]) -> ServerTools {
        ServerTools {
            server_name: name.into(),
            tool_prefix: prefix.map(Into::into),
            tools: tools.iter().map(|t| descriptor(name, t)).collect(),
        }
    }

    #[test]
    fn prefix_strategy_prefixes_everything() {
        let servers = vec![server("fs", None, &["read", "write"])];
        let catalog = resolve_names(NamespacingStrategy::Prefix, &servers);
        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["fs_read", "fs_write"]);
    }

    #[test]
    fn prefix_strategy_honours_tool_prefix_override() {
        let servers = vec![server("filesystem", Some("fs"), &["read"])];
        let catalog = resolve_names(NamespacingStrategy::Prefix, &servers);
        assert_eq!(catalog[0].exposed_name, "fs_read");
    }

    #[test]
    fn auto_single_server_uses_raw_names() {
        let servers = vec![server("fs", None, &["read", "write"])];
        let catalog = resolve_names(NamespacingStrategy::Auto, &servers);
        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["read", "write"]);
    }

    #[test]
    fn auto_two_servers_prefixes_collisions_and_all() {
        let servers = vec![
            server("fs", None, &["read"]),
            server("net", None, &["read"]),
        ];
        let catalog = resolve_names(NamespacingStrategy::Auto, &servers);
        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["fs_read", "net_read"]);
    }

    #[test]
    fn none_strategy_last_registered_wins() {
        let servers = vec![
            server("fs", None, &["read"]),
            server("net", None, &["read"]),
        ];
        let catalog = resolve_names(NamespacingStrategy::None, &servers);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].exposed_name, "read");
        assert_eq!(catalog[0].descriptor.server_name, "net");
    }

    #[test]
    fn route_prefixed_name() {
        let servers = vec![
            server("fs", None, &["read"]),
            server("net", None, &["read"]),
        ];
        let (owner, original) = route(&servers, "fs_read").unwrap();
        assert_eq!(owner, "fs");
        assert_eq!(original, "read");

        let (owner, original) = route(&servers, "net_read").unwrap();
        assert_eq!(owner, "net");
        assert_eq!(original, "read");
    }

    #[test]
    fn route_exact_original_name() {
        let servers = vec![server("fs", None, &["list_files"])];
        let (owner, original) = route(&servers, "list_files").unwrap();
        assert_eq!(owner, "fs");
        assert_eq!(original, "list_files");
    }

    #[test]
    fn route_tolerates_separator_mangling() {
        let servers = vec![server("fs", None, &["read-file"])];
        // Model converted the dash to an underscore.
        let (owner, original) = route(&servers, "read_file").unwrap();
        assert_eq!(owner, "fs");
        assert_eq!(original, "read-file");

        // Same with a prefixed form.
        let (owner, original) = route(&servers, "fs_read_file").unwrap();
        assert_eq!(owner, "fs");
        assert_eq!(original, "read-file");
    }

    #[test]
    fn route_unknown_name_is_none() {
        let servers = vec![server("fs", None, &["read"])];
        assert!(route(&servers, "unknown_tool").is_none());
    }

    #[test]
    fn prefix_with_underscore_in_server_name_routes_back() {
        let servers = vec![server("my_tools", None, &["run"])];
        let catalog = resolve_names(NamespacingStrategy::Prefix, &servers);
        assert_eq!(catalog[0].exposed_name, "my_tools_run");
        let (owner, original) = route(&servers, "my_tools_run").unwrap();
        assert_eq!(owner, "my_tools");
        assert_eq!(original, "run");
    }
}
