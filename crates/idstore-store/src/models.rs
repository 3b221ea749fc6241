//! Record types persisted as documents.
//!
//! Every struct derives `Serialize` and `Deserialize`; fields introduced by
//! later schema versions default when absent so that documents written under
//! an older version still load.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::field::Field;
use crate::update::{element_key, ElementKey};

/// Login provider under which the store keeps its own tokens.
pub const INTERNAL_LOGIN_PROVIDER: &str = "[AccountStore]";
/// Token name of the authenticator (TOTP) key.
pub const AUTHENTICATOR_KEY_TOKEN: &str = "AuthenticatorKey";
/// Token name of the `;`-joined second-factor recovery codes.
pub const RECOVERY_CODES_TOKEN: &str = "RecoveryCodes";

/// A document type addressed by an opaque id.
pub trait Record: Serialize + DeserializeOwned {
    fn id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Nested list elements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// An external login bound to an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginBinding {
    pub login_provider: String,
    pub provider_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A named token kept for a login provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenEntry {
    pub login_provider: String,
    pub name: String,
    pub value: String,
}

impl TokenEntry {
    /// A token the store keeps under [`INTERNAL_LOGIN_PROVIDER`].
    pub fn internal(name: &str, value: impl Into<String>) -> Self {
        Self {
            login_provider: INTERNAL_LOGIN_PROVIDER.to_string(),
            name: name.to_string(),
            value: value.into(),
        }
    }

    /// Identity of a token inside the `tokens` list.
    pub fn key(login_provider: &str, name: &str) -> ElementKey {
        element_key([
            ("login_provider", login_provider.into()),
            ("name", name.into()),
        ])
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountRecord {
    pub id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub normalized_user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub normalized_email: Option<String>,
    #[serde(default)]
    pub email_confirmed: bool,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub security_stamp: Option<String>,
    #[serde(default)]
    pub concurrency_stamp: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub phone_number_confirmed: bool,
    #[serde(default)]
    pub two_factor_enabled: bool,
    #[serde(default)]
    pub lockout_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lockout_enabled: bool,
    #[serde(default)]
    pub access_failed_count: i32,
    /// Ids of the roles this account belongs to.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub logins: Vec<LoginBinding>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

impl AccountRecord {
    pub const USER_NAME: Field<Self, String> = Field::new("user_name");
    pub const NORMALIZED_USER_NAME: Field<Self, String> = Field::new("normalized_user_name");
    pub const EMAIL: Field<Self, String> = Field::new("email");
    pub const NORMALIZED_EMAIL: Field<Self, String> = Field::new("normalized_email");
    pub const EMAIL_CONFIRMED: Field<Self, bool> = Field::new("email_confirmed");
    pub const PASSWORD_HASH: Field<Self, String> = Field::new("password_hash");
    pub const SECURITY_STAMP: Field<Self, String> = Field::new("security_stamp");
    pub const CONCURRENCY_STAMP: Field<Self, String> = Field::new("concurrency_stamp");
    pub const PHONE_NUMBER: Field<Self, String> = Field::new("phone_number");
    pub const PHONE_NUMBER_CONFIRMED: Field<Self, bool> = Field::new("phone_number_confirmed");
    pub const TWO_FACTOR_ENABLED: Field<Self, bool> = Field::new("two_factor_enabled");
    pub const LOCKOUT_END: Field<Self, DateTime<Utc>> = Field::new("lockout_end");
    pub const LOCKOUT_ENABLED: Field<Self, bool> = Field::new("lockout_enabled");
    pub const ACCESS_FAILED_COUNT: Field<Self, i32> = Field::new("access_failed_count");
    pub const ROLES: Field<Self, Vec<String>> = Field::new("roles");
    pub const CLAIMS: Field<Self, Vec<Claim>> = Field::new("claims");
    pub const LOGINS: Field<Self, Vec<LoginBinding>> = Field::new("logins");
    pub const TOKENS: Field<Self, Vec<TokenEntry>> = Field::new("tokens");

    /// A fresh account with a new id and stamps.
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_name: Some(user_name.into()),
            security_stamp: Some(Uuid::new_v4().to_string()),
            concurrency_stamp: Some(Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }
}

impl Record for AccountRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoleRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub normalized_name: Option<String>,
    #[serde(default)]
    pub concurrency_stamp: Option<String>,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

impl RoleRecord {
    pub const NAME: Field<Self, String> = Field::new("name");
    pub const NORMALIZED_NAME: Field<Self, String> = Field::new("normalized_name");
    pub const CONCURRENCY_STAMP: Field<Self, String> = Field::new("concurrency_stamp");
    pub const CLAIMS: Field<Self, Vec<Claim>> = Field::new("claims");

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: Some(name.into()),
            concurrency_stamp: Some(Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }
}

impl Record for RoleRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Migration history
// ---------------------------------------------------------------------------

/// Proof that a migration step was applied.  `database_version` is the
/// step's version plus one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Assigned by the store on insert; empty until then.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub database_version: u32,
    pub installed_on: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(database_version: u32, installed_on: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            database_version,
            installed_on,
        }
    }
}

// Version decides; the timestamp only orders entries for display.
impl Ord for HistoryRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.database_version
            .cmp(&other.database_version)
            .then_with(|| self.installed_on.cmp(&other.installed_on))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for HistoryRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
