/// The slice of an inbound request the engine cares about. The gateway's
/// auth middleware fills this in; the engine never sees the transport.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated user identifier, when the session resolved one.
    pub user_id: Option<String>,
    /// Caller's network address, always present.
    pub remote_addr: String,
    /// Endpoint path being requested.
    pub endpoint: String,
    pub user_agent: Option<String>,
}

/// Resolves the key under which behavior is aggregated. Returns the key and
/// whether it belongs to an authenticated user.
pub trait IdentitySource: Send + Sync {
    fn resolve(&self, request: &RequestContext) -> (String, bool);
}

/// Standard resolution: the authenticated user id when known, otherwise the
/// caller's network address.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIdentitySource;

impl IdentitySource for DefaultIdentitySource {
    fn resolve(&self, request: &RequestContext) -> (String, bool) {
        match &request.user_id {
            Some(id) => (id.clone(), true),
            None => (request.remote_addr.clone(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_user_wins() {
        let request = RequestContext {
            user_id: Some("user-42".to_string()),
            remote_addr: "10.0.0.1".to_string(),
            ..Default::default()
        };
        let (key, authenticated) = DefaultIdentitySource.resolve(&request);
        assert_eq!(key, "user-42");
        assert!(authenticated);
    }

    #[test]
    fn test_falls_back_to_address() {
        let request = RequestContext {
            remote_addr: "10.0.0.1".to_string(),
            ..Default::default()
        };
        let (key, authenticated) = DefaultIdentitySource.resolve(&request);
        assert_eq!(key, "10.0.0.1");
        assert!(!authenticated);
    }
}
