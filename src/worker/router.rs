//! Topic Router - maps a connection group to its broker topic.
//!
//! The topic name comes from a pattern with a single `%s` placeholder:
//!
//! ```text
//! Pattern               | Group     | Topic
//! ----------------------|-----------|---------------------------
//! clickstream-%s-log    | viewer    | clickstream-viewer-log
//! clickstream-%s-log    | admin     | clickstream-admin-log
//! events.%s             | ""        | events.
//! ```
//!
//! The first request for a group creates the topic on the broker, and the
//! name is cached once creation succeeds. Concurrent first requests for the
//! same group share one creation call and all see its outcome. A failed
//! creation is not cached, so the next request tries again.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Longest topic name the broker accepts.
const MAX_TOPIC_NAME_LEN: usize = 249;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("creation of topic '{topic}' rejected: {reason}")]
    CreationRejected { topic: String, reason: String },

    #[error("group '{0}' does not form a valid topic name")]
    MalformedGroup(String),
}

/// Broker-side topic management.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Create `name`. A topic that already exists counts as success.
    async fn create_topic(&self, name: &str) -> Result<(), RouterError>;
}

type Attempt = Arc<OnceCell<Result<String, RouterError>>>;

pub struct TopicRouter {
    pattern: String,
    admin: Arc<dyn TopicAdmin>,
    /// group -> topic, only for topics known to exist
    topics: RwLock<HashMap<String, String>>,
    /// group -> creation currently underway
    in_flight: Mutex<HashMap<String, Attempt>>,
}

impl TopicRouter {
    pub fn new(pattern: impl Into<String>, admin: Arc<dyn TopicAdmin>) -> Self {
        Self {
            pattern: pattern.into(),
            admin,
            topics: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Topic name for a group, without touching the broker.
    pub fn topic_name(&self, group: &str) -> String {
        self.pattern.replacen("%s", group, 1)
    }

    /// Resolve the topic for `group`, creating it on first use.
    pub async fn get_topic(&self, group: &str) -> Result<String, RouterError> {
        if let Some(topic) = self.cached(group) {
            return Ok(topic);
        }

        let topic = self.topic_name(group);
        if !is_valid_topic_name(&topic) {
            return Err(RouterError::MalformedGroup(group.to_string()));
        }

        let attempt = {
            let mut in_flight = self.in_flight.lock();
            // re-check under the lock: a creation may have just finished
            if let Some(topic) = self.cached(group) {
                return Ok(topic);
            }
            in_flight
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let outcome = attempt
            .get_or_init(|| async {
                let result = self.admin.create_topic(&topic).await;
                match &result {
                    Ok(()) => {
                        info!(group = %group, topic = %topic, "Topic ready");
                        self.topics
                            .write()
                            .insert(group.to_string(), topic.clone());
                    }
                    Err(e) => warn!(group = %group, topic = %topic, error = %e, "Topic creation failed"),
                }
                result.map(|()| topic.clone())
            })
            .await
            .clone();

        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(group)
            .is_some_and(|current| Arc::ptr_eq(current, &attempt))
        {
            in_flight.remove(group);
        }

        outcome
    }

    /// Number of groups with a known topic.
    pub fn cached_topics(&self) -> usize {
        self.topics.read().len()
    }

    fn cached(&self, group: &str) -> Option<String> {
        self.topics.read().get(group).cloned()
    }
}

fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOPIC_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}
