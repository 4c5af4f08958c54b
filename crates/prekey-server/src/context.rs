//! Per-request caller information.

/// Role recorded for actors when the caller does not supply one.
pub const DEFAULT_ACTOR_ROLE: &str = "user";

/// Who is calling and how long they are willing to wait.
///
/// Carried into every [`BundleService`](crate::BundleService) operation. The
/// actor fields end up in audit events; the deadline bounds store work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated caller. Audit events fall back to the target user.
    pub actor_id: Option<String>,
    /// Caller's role. Defaults to [`DEFAULT_ACTOR_ROLE`].
    pub actor_role: Option<String>,
    /// Client user agent, recorded verbatim
    pub user_agent: Option<String>,
    /// Unix timestamp (seconds) after which no new store step is started
    pub deadline_secs: Option<u64>,
}

impl RequestContext {
    /// Context with no actor information and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the calling actor.
    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the caller's role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.actor_role = Some(role.into());
        self
    }

    /// Set the client user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline_secs: u64) -> Self {
        self.deadline_secs = Some(deadline_secs);
        self
    }

    /// Actor id for audit events, falling back to the target user.
    pub fn actor_id_or<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.actor_id.as_deref().unwrap_or(user_id)
    }

    /// Actor role for audit events.
    pub fn actor_role(&self) -> &str {
        self.actor_role.as_deref().unwrap_or(DEFAULT_ACTOR_ROLE)
    }

    /// Whether the deadline has passed at `now_secs`.
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.deadline_secs.is_some_and(|deadline| now_secs >= deadline)
    }
}
