//! User directory state machine and its operation tokens.

use std::collections::HashMap;
use std::fmt;

use super::User;

use crate::utils::TripStoreError;

use serde::{Deserialize, Serialize};

use tokio::sync::{Mutex, MutexGuard};

/// Maximum length of a name or password field.
const MAX_FIELD_LEN: usize = 100;

/// Account lifecycle operation replicated through 2PC.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DirectoryOp {
    SignUp {
        name: String,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout {
        email: String,
    },
}

impl DirectoryOp {
    /// Parses the client's `name|email|password` signup info. On invalid
    /// input, returns the message to reply with.
    pub fn parse_signup(info: &str) -> Result<Self, String> {
        let fields: Vec<&str> = info.split('|').collect();
        match fields[..] {
            [name, email, password]
                if valid_field(name)
                    && valid_email(email)
                    && valid_field(password) =>
            {
                Ok(DirectoryOp::SignUp {
                    name: name.into(),
                    email: email.into(),
                    password: password.into(),
                })
            }
            _ => Err("Invalid Signup input. Signup requires 3 parameters: \
                      Name, Email, Password"
                .into()),
        }
    }

    /// Parses the client's `email|password` login info. On invalid input,
    /// returns the message to reply with.
    pub fn parse_login(info: &str) -> Result<Self, String> {
        let fields: Vec<&str> = info.split('|').collect();
        match fields[..] {
            [email, password] if valid_email(email) && valid_field(password) => {
                Ok(DirectoryOp::Login {
                    email: email.into(),
                    password: password.into(),
                })
            }
            _ => Err("Invalid Login input. Login requires 2 parameters: \
                      Email, Password"
                .into()),
        }
    }

    /// The directory key (email) this operation mutates.
    pub fn key(&self) -> &str {
        match self {
            DirectoryOp::SignUp { email, .. } => email,
            DirectoryOp::Login { email, .. } => email,
            DirectoryOp::Logout { email } => email,
        }
    }

    /// Token form shipped to 2PC participants and written to the
    /// transaction log.
    pub fn to_tokens(&self) -> Vec<String> {
        match self {
            DirectoryOp::SignUp {
                name,
                email,
                password,
            } => vec![
                "SIGNUP".into(),
                name.clone(),
                email.clone(),
                password.clone(),
            ],
            DirectoryOp::Login { email, password } => {
                vec!["LOGIN".into(), email.clone(), password.clone()]
            }
            DirectoryOp::Logout { email } => vec!["LOGOUT".into(), email.clone()],
        }
    }

    /// Inverse of `to_tokens()`.
    pub fn from_tokens(tokens: &[String]) -> Result<Self, TripStoreError> {
        let tokens: Vec<&str> = tokens.iter().map(|t| t.as_str()).collect();
        match tokens[..] {
            ["SIGNUP", name, email, password] => Ok(DirectoryOp::SignUp {
                name: name.into(),
                email: email.into(),
                password: password.into(),
            }),
            ["LOGIN", email, password] => Ok(DirectoryOp::Login {
                email: email.into(),
                password: password.into(),
            }),
            ["LOGOUT", email] => Ok(DirectoryOp::Logout {
                email: email.into(),
            }),
            _ => Err(TripStoreError(format!(
                "malformed directory op tokens {:?}",
                tokens
            ))),
        }
    }
}

impl fmt::Display for DirectoryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirectoryOp::SignUp { email, .. } => write!(f, "SIGNUP {}", email),
            DirectoryOp::Login { email, .. } => write!(f, "LOGIN {}", email),
            DirectoryOp::Logout { email } => write!(f, "LOGOUT {}", email),
        }
    }
}

fn valid_field(field: &str) -> bool {
    !field.is_empty() && field.len() <= MAX_FIELD_LEN
}

fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && email.len() <= MAX_FIELD_LEN
        }
        None => false,
    }
}

/// The replicated user directory: email -> `User`. All mutations happen
/// under the one mutex, so at most one is in flight at a time.
pub struct UserDirectory {
    /// Node name used as logging prefix.
    me: String,

    users: Mutex<HashMap<String, User>>,
}

impl UserDirectory {
    /// Creates an empty directory.
    pub fn new(me: impl ToString) -> Self {
        UserDirectory {
            me: me.to_string(),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a committed operation, returning the reply message.
    pub async fn apply(&self, op: &DirectoryOp) -> String {
        let mut users = self.users.lock().await;
        let result = match op {
            DirectoryOp::SignUp {
                name,
                email,
                password,
            } => {
                if users.contains_key(email) {
                    "User already Exists"
                } else {
                    users.insert(email.clone(), User::new(name, email, password));
                    "User Created"
                }
            }

            DirectoryOp::Login { email, password } => match users.get_mut(email) {
                None => "User Not Found",
                Some(user) if user.logged_in => "User already Logged-in",
                Some(user) if user.password == *password => {
                    user.logged_in = true;
                    "User Logged in"
                }
                Some(_) => "Invalid Credentials",
            },

            DirectoryOp::Logout { email } => match users.get_mut(email) {
                None => "User Not Found",
                Some(user) => {
                    user.logged_in = false;
                    "User Successfully Logged Out!"
                }
            },
        };

        pf_debug!(self.me; "applied {}: {}", op, result);
        result.into()
    }

    /// Does a user with this email exist?
    pub async fn contains(&self, email: &str) -> bool {
        self.users.lock().await.contains_key(email)
    }

    /// Is the user with this email currently logged in?
    pub async fn is_logged_in(&self, email: &str) -> bool {
        self.users
            .lock()
            .await
            .get(email)
            .map(|u| u.logged_in)
            .unwrap_or(false)
    }

    /// Snapshot copy of a user record.
    pub async fn user(&self, email: &str) -> Option<User> {
        self.users.lock().await.get(email).cloned()
    }

    /// Locks the directory for owner/sharee bookkeeping done by the
    /// itinerary store.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, HashMap<String, User>> {
        self.users.lock().await
    }
}
