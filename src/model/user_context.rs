use serde::{Deserialize, Serialize};

use crate::model::Id;

/// The authenticated actor on whose behalf an engine operation runs.
///
/// Authentication happens upstream; the engine only uses the id for
/// ownership and visibility checks and for audit fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Id,
    pub display_name: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<Id>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn with_name(user_id: impl Into<Id>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: Some(display_name.into()),
        }
    }

    /// Actor used for catalog seeding and other internal writes
    pub fn system() -> Self {
        Self::with_name("system", "System")
    }

    pub fn owns(&self, owner_id: &str) -> bool {
        self.user_id == owner_id
    }

    /// Name recorded as author/publisher on things this actor creates
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_context_creation() {
        let ctx = UserContext::with_name("user123", "Test User");
        assert_eq!(ctx.user_id, "user123");
        assert!(ctx.owns("user123"));
        assert!(!ctx.owns("someone-else"));
        assert_eq!(ctx.label(), "Test User");
        assert_eq!(UserContext::new("u").label(), "u");
    }
}
