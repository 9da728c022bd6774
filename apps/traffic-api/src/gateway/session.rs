//! Per-connection gateway session state.

/// State for a single WebSocket connection.
pub struct GatewaySession {
    /// Connection identity (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Domain channel this connection currently listens on.
    domain: String,
}

impl GatewaySession {
    pub fn new(connection_id: String, domain: String) -> Self {
        Self {
            connection_id,
            domain,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Leave the current domain channel and join `domain`.
    pub fn join(&mut self, domain: String) {
        self.domain = domain;
    }

    /// Check whether this session should receive `traffic` for a domain.
    pub fn is_subscribed(&self, domain: &str) -> bool {
        self.domain == domain
    }
}
