use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::engine::Engine;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Per-account cleartext login. The startup `user` names the account every
/// query on the session runs as.
///
/// Accounts that set a password must present it. Accounts without one, and
/// unknown names when auto-registration is on, use the shared registration
/// password.
pub struct ReservdAuthSource {
    engine: Arc<Engine>,
    registration_password: String,
    auto_register: bool,
}

impl std::fmt::Debug for ReservdAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservdAuthSource")
            .field("auto_register", &self.auto_register)
            .finish_non_exhaustive()
    }
}

impl ReservdAuthSource {
    pub fn new(engine: Arc<Engine>, registration_password: String, auto_register: bool) -> Self {
        Self {
            engine,
            registration_password,
            auto_register,
        }
    }

    /// Password the named user must present, or `None` to refuse the login.
    pub fn expected_password(&self, user: &str) -> Option<String> {
        if user.trim().is_empty() {
            return None;
        }
        match self.engine.stored_password(user) {
            Ok(Some(own)) => Some(own),
            Ok(None) => Some(self.registration_password.clone()),
            Err(_) if self.auto_register => Some(self.registration_password.clone()),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl AuthSource for ReservdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.expected_password(user) {
            Some(password) => Ok(Password::new(None, password.into_bytes())),
            None => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!(user, "rejected login for unknown or empty user");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28000".into(),
                    format!("role {user:?} does not exist"),
                ))))
            }
        }
    }
}
