use std::sync::Arc;

use tokio::sync::RwLock;

/// The `tw-auth` session cookie, shared between the HTTP transport and the
/// socket session. Impersonation rotates it atomically so no in-flight
/// request observes a half-rotated value.
#[derive(Debug, Clone)]
pub struct AuthToken(Arc<RwLock<String>>);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(value.into())))
    }

    pub async fn get(&self) -> String {
        self.0.read().await.clone()
    }

    pub async fn set(&self, value: impl Into<String>) {
        let mut guard = self.0.write().await;
        *guard = value.into();
    }

    pub fn cookie_header(value: &str) -> String {
        format!("tw-auth={value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotation_is_visible_to_every_clone() {
        let token = AuthToken::new("old");
        let clone = token.clone();
        token.set("new").await;
        assert_eq!(clone.get().await, "new");
    }
}
