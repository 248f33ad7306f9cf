use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::TokenKeys;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Raw bearer token as sent by the client.
    #[serde(default)]
    pub bearer: Option<String>,
    /// Filled by the router once the bearer token has been checked.
    #[serde(skip)]
    pub principal: Option<Principal>,
}

impl Request {
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
            bearer: None,
            principal: None,
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

pub struct AppState {
    pub db: Connection,
    pub keys: TokenKeys,
    /// Domain appended to bare usernames by the identity match chain.
    pub email_domain: String,
    pub password_rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Staff,
    Teacher,
    Parent,
    Guardian,
    Student,
}

impl Role {
    pub const OFFICE: &'static [Role] = &[Role::Admin, Role::Staff];
    pub const PERSONNEL: &'static [Role] = &[Role::Admin, Role::Staff, Role::Teacher];
    pub const FAMILY: &'static [Role] = &[Role::Parent, Role::Guardian, Role::Student];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "staff" => Some(Self::Staff),
            "teacher" => Some(Self::Teacher),
            "parent" => Some(Self::Parent),
            "guardian" => Some(Self::Guardian),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Teacher => "teacher",
            Self::Parent => "parent",
            Self::Guardian => "guardian",
            Self::Student => "student",
        }
    }

    pub fn is_personnel(self) -> bool {
        Self::PERSONNEL.contains(&self)
    }
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
}
