use crate::types::UserId;

const BUFFER_SUFFIX: &str = "messages";
const PENDING_JOB_SUFFIX: &str = "task_id";
const LOCK_SUFFIX: &str = "lock";

/// Key naming for the three per-user families: `{namespace}_{user}_{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Namespace derived from the bot's public URL so deployments sharing a
    /// store do not collide.
    pub fn for_bot_url(bot_url: &str) -> Self {
        Self::new(format!("user_{}", clean_bot_url(bot_url)))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn buffer(&self, user: &UserId) -> String {
        self.key(user, BUFFER_SUFFIX)
    }

    pub fn pending_job(&self, user: &UserId) -> String {
        self.key(user, PENDING_JOB_SUFFIX)
    }

    pub fn lock(&self, user: &UserId) -> String {
        self.key(user, LOCK_SUFFIX)
    }

    pub fn lock_pattern(&self) -> String {
        format!("{}_*_{LOCK_SUFFIX}", self.namespace)
    }

    fn key(&self, user: &UserId, suffix: &str) -> String {
        format!("{}_{}_{}", self.namespace, user, suffix)
    }
}

pub fn clean_bot_url(url: &str) -> String {
    url.trim()
        .replace("https://", "")
        .replace(".herokuapp.com/", "")
}
