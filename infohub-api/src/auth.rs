use uuid::Uuid;

use crate::{require_len, Error, FieldErrors, Role, Team};

pub const BCRYPT_COST: u32 = 10;
pub const MIN_PASSWORD_LEN: usize = 8;

/// Name of the cookie carrying the session token for browser clients
pub const SESSION_COOKIE: &str = "infohub-session";

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewSession {
    pub email: String,
    pub password: String,
    pub device: String,
}

impl NewSession {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.email)?;
        crate::validate_string(&self.password)?;
        crate::validate_string(&self.device)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewUser {
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub team: Team,

    /// Only honored on the admin route, self-registration always gets `User`
    #[serde(default)]
    pub role: Role,
}

impl NewUser {
    pub fn new(full_name: String, email: String, password: String, team: Team) -> NewUser {
        NewUser {
            full_name,
            email,
            confirm_password: password.clone(),
            password,
            team,
            role: Role::User,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.full_name)?;
        crate::validate_string(&self.email)?;
        crate::validate_string(&self.password)?;
        crate::validate_string(&self.confirm_password)?;

        let mut errors = FieldErrors::new();
        require_len(&mut errors, "fullName", &self.full_name, 2, "Name is too short");
        if validate_email(&self.email).is_err() {
            errors
                .entry(String::from("email"))
                .or_insert_with(Vec::new)
                .push(String::from("Invalid email address"));
        }
        if validate_password(&self.password).is_err() {
            errors
                .entry(String::from("password"))
                .or_insert_with(Vec::new)
                .push(format!(
                    "Password must be at least {MIN_PASSWORD_LEN} characters"
                ));
        }
        if !errors.is_empty() {
            return Err(Error::InvalidFields(errors));
        }
        if self.password != self.confirm_password {
            return Err(Error::field("confirmPassword", "Passwords do not match"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

impl ChangePassword {
    /// Checks everything that can be checked without knowing the stored hash
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.current_password)?;
        crate::validate_string(&self.new_password)?;
        crate::validate_string(&self.confirm_password)?;
        if self.current_password.is_empty()
            || self.new_password.is_empty()
            || self.confirm_password.is_empty()
        {
            return Err(Error::field("message", "All fields are required."));
        }
        if self.new_password != self.confirm_password {
            return Err(Error::field("confirmPassword", "New passwords do not match."));
        }
        validate_password(&self.new_password)
    }
}

/// Accepts `local@domain.tld` with no whitespace, which is all the sign-up form promises
pub fn validate_email(email: &str) -> Result<(), Error> {
    let invalid = || Error::field("email", "Invalid email address");
    if email.len() > 255 || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() && !host.ends_with('.') => Ok(()),
        _ => Err(invalid()),
    }
}

pub fn validate_password(password: &str) -> Result<(), Error> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        Err(Error::field(
            "password",
            &format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        ))
    } else {
        Ok(())
    }
}
