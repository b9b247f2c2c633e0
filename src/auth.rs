use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::limits::MAX_NAME_LEN;
use crate::model::{Identity, Role};

#[derive(Debug)]
pub struct TutorflowAuthSource {
    password: String,
}

impl TutorflowAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TutorflowAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Read the identity carried in the login user: `role:user_id`, or a bare
/// name for a student. The system role is never granted to a client.
pub fn identity_from_login(user: &str) -> Result<Identity, String> {
    let user = user.trim();
    let (role, user_id) = match user.split_once(':') {
        Some((role, id)) => {
            let role = Role::parse(role).ok_or_else(|| format!("unknown role {role:?}"))?;
            (role, id.trim())
        }
        None => (Role::Student, user),
    };
    if role == Role::System {
        return Err("the system role cannot log in".into());
    }
    if user_id.is_empty() {
        return Err("login user names no user id".into());
    }
    if user_id.len() > MAX_NAME_LEN {
        return Err("user id too long".into());
    }
    Ok(Identity::new(user_id, role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_user_carries_role() {
        assert_eq!(
            identity_from_login("tutor:t-17").unwrap(),
            Identity::new("t-17", Role::Tutor)
        );
        assert_eq!(
            identity_from_login("Manager: m-2").unwrap(),
            Identity::new("m-2", Role::Management)
        );
        assert_eq!(identity_from_login("alice").unwrap(), Identity::new("alice", Role::Student));
    }

    #[test]
    fn bad_logins_are_refused() {
        assert!(identity_from_login("system:cron").is_err());
        assert!(identity_from_login("janitor:j1").is_err());
        assert!(identity_from_login("tutor:").is_err());
        assert!(identity_from_login("  ").is_err());
    }
}
