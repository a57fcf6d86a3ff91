//! Login and registration policy.
//!
//! Until a peer logs in, the server only honors `login` and `register`
//! requests. What counts as valid credentials is up to the host; the server
//! only hands the raw request body to a [`LoginPolicy`] and relays the
//! outcome.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::protocol::form::{FormField, FormSpec};

/// Result of a login or registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Accepted; carries the identity the peer is now known by.
    Accepted(String),
    /// Rejected; carries a message for the user.
    Rejected(String),
}

pub trait LoginPolicy: Send + Sync {
    /// Fields a client must fill in to log in.
    fn login_form(&self) -> FormSpec;

    /// Fields a client must fill in to register.
    fn register_form(&self) -> FormSpec;

    fn login(&self, request: &[u8]) -> LoginOutcome;

    fn register(&self, request: &[u8]) -> LoginOutcome;
}

const FIELD_SEPARATOR: char = ';';

/// In-memory user/password table.
///
/// Requests are `user;password`, matching the default form
/// `user;#password`.
#[derive(Debug, Default)]
pub struct StaticLogin {
    users: RwLock<HashMap<String, String>>,
    allow_registration: bool,
}

impl StaticLogin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let unknown users create an account with `register`.
    pub fn with_registration(mut self) -> Self {
        self.allow_registration = true;
        self
    }

    pub fn with_user(self, user: &str, password: &str) -> Self {
        self.users
            .write()
            .insert(user.to_string(), password.to_string());
        self
    }

    fn credentials(request: &[u8]) -> Option<(String, String)> {
        let text = String::from_utf8_lossy(request);
        let (user, password) = text.split_once(FIELD_SEPARATOR)?;
        if user.is_empty() {
            return None;
        }
        Some((user.to_string(), password.to_string()))
    }
}

impl LoginPolicy for StaticLogin {
    fn login_form(&self) -> FormSpec {
        FormSpec::new(vec![
            FormField::Text("user".into()),
            FormField::Hidden("password".into()),
        ])
    }

    fn register_form(&self) -> FormSpec {
        self.login_form()
    }

    fn login(&self, request: &[u8]) -> LoginOutcome {
        let Some((user, password)) = Self::credentials(request) else {
            return LoginOutcome::Rejected("malformed login request".into());
        };
        match self.users.read().get(&user) {
            Some(expected) if *expected == password => {
                info!(%user, "User logged in");
                LoginOutcome::Accepted(user)
            }
            _ => {
                debug!(%user, "Login rejected");
                LoginOutcome::Rejected("invalid user or password".into())
            }
        }
    }

    fn register(&self, request: &[u8]) -> LoginOutcome {
        if !self.allow_registration {
            return LoginOutcome::Rejected("registration is closed".into());
        }
        let Some((user, password)) = Self::credentials(request) else {
            return LoginOutcome::Rejected("malformed registration request".into());
        };
        let mut users = self.users.write();
        if users.contains_key(&user) {
            return LoginOutcome::Rejected(format!("user {user} already exists"));
        }
        users.insert(user.clone(), password);
        info!(%user, "User registered");
        LoginOutcome::Accepted(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login() {
        let policy = StaticLogin::new().with_user("alice", "secret");
        assert_eq!(policy.login(b"alice;secret"), LoginOutcome::Accepted("alice".into()));
        assert!(matches!(policy.login(b"alice;wrong"), LoginOutcome::Rejected(_)));
        assert!(matches!(policy.login(b"alice"), LoginOutcome::Rejected(_)));
    }

    #[test]
    fn test_registration() {
        let closed = StaticLogin::new();
        assert!(matches!(closed.register(b"bob;pw"), LoginOutcome::Rejected(_)));

        let open = StaticLogin::new().with_registration();
        assert_eq!(open.register(b"bob;pw"), LoginOutcome::Accepted("bob".into()));
        assert!(matches!(open.register(b"bob;pw"), LoginOutcome::Rejected(_)));
        assert_eq!(open.login(b"bob;pw"), LoginOutcome::Accepted("bob".into()));
    }

    #[test]
    fn test_default_form() {
        assert_eq!(StaticLogin::new().login_form().to_string(), "user;#password");
    }
}
