//! Authorization of the emergency-stop reset.

use async_trait::async_trait;

#[async_trait]
pub trait ResetAuthorizer: Send + Sync + 'static {
    /// Whether resets can be authorized at all.
    fn enabled(&self) -> bool;

    /// Validate a bearer token. Returns true if it may reset the stop.
    async fn authorize(&self, token: &str) -> bool;
}

/// Single shared token from `web.reset_token`. Without one, resets are refused.
pub struct StaticTokenAuthorizer {
    token: Option<String>,
}

impl StaticTokenAuthorizer {
    pub fn new(token: Option<String>) -> Self {
        Self { token: token.filter(|t| !t.is_empty()) }
    }
}

#[async_trait]
impl ResetAuthorizer for StaticTokenAuthorizer {
    fn enabled(&self) -> bool {
        self.token.is_some()
    }

    async fn authorize(&self, token: &str) -> bool {
        let Some(expected) = &self.token else { return false };
        // Compare every byte regardless of where the first mismatch is.
        expected.len() == token.len()
            && expected.bytes().zip(token.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }
}
