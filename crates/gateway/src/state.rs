//! Shared application state handed to the control API.

use std::sync::Arc;

use tb_domain::config::BrokerConfig;
use tb_engine::TurnEngine;
use tb_servers::{ConnectionManager, HealthMonitor, ToolServerRegistry};
use tb_sessions::{ConversationStore, JanitorService, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub registry: Arc<ToolServerRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub health: Arc<HealthMonitor>,
    pub sessions: Arc<SessionManager>,
    pub conversations: Arc<ConversationStore>,
    pub janitor: Arc<JanitorService>,
    pub engine: Arc<TurnEngine>,
}
