//! The signed-in identity every request is made with.

use shared::{
    domain::{User, UserId},
    protocol::LoginResponse,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("user {0} is not an admin and cannot act as another user")]
    NotAdmin(UserId),
    #[error("no user is signed in")]
    NotSignedIn,
}

/// Authenticated user, bearer token and the optional user an admin is
/// currently acting as.
#[derive(Debug, Clone)]
pub struct SessionContext {
    authenticated_user: User,
    acting_as: Option<User>,
    api_token: String,
}

impl SessionContext {
    pub fn new(authenticated_user: User, api_token: impl Into<String>) -> Self {
        Self {
            authenticated_user,
            acting_as: None,
            api_token: api_token.into(),
        }
    }

    pub fn from_login(response: LoginResponse) -> Self {
        Self::new(response.user, response.token)
    }

    pub fn authenticated_user(&self) -> &User {
        &self.authenticated_user
    }

    pub fn acting_as(&self) -> Option<&User> {
        self.acting_as.as_ref()
    }

    pub fn api_token(&self) -> &str {
        &self.api_token
    }

    /// The user whose view the session is showing.
    pub fn effective_user(&self) -> &User {
        self.acting_as.as_ref().unwrap_or(&self.authenticated_user)
    }

    pub fn is_impersonating(&self) -> bool {
        self.acting_as.is_some()
    }

    pub fn impersonate(&mut self, user: User) -> Result<(), SessionError> {
        if !self.authenticated_user.is_admin() {
            return Err(SessionError::NotAdmin(self.authenticated_user.id));
        }
        self.acting_as = Some(user);
        Ok(())
    }

    pub fn stop_impersonating(&mut self) {
        self.acting_as = None;
    }
}
