//! Account records.
//!
//! [`AccountStore`] is the record-access layer for accounts.  Every helper
//! that changes an account first updates the caller's in-memory copy, then
//! issues a single-field or set-style update for just that field.  Only
//! [`AccountStore::create`] and [`AccountStore::update`] write whole
//! documents.  Getters return the freshest persisted value and fall back to
//! the in-memory copy when the store has nothing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::accessor::FieldProjectionAccessor;
use crate::collection::DocumentCollection;
use crate::error::{Result, StoreError};
use crate::field::Field;
use crate::filter::Filter;
use crate::models::{
    AccountRecord, Claim, LoginBinding, TokenEntry, AUTHENTICATOR_KEY_TOKEN,
    INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN,
};
use crate::roles::RoleStore;
use crate::update::{element_key, matches_key};

type AccountField<T> = Field<AccountRecord, T>;

/// Record access for the accounts collection.
pub struct AccountStore<'c> {
    accounts: FieldProjectionAccessor<'c, AccountRecord>,
    roles: RoleStore<'c>,
}

impl<'c> AccountStore<'c> {
    pub fn new(accounts: &'c dyn DocumentCollection, roles: &'c dyn DocumentCollection) -> Self {
        Self {
            accounts: FieldProjectionAccessor::new(accounts),
            roles: RoleStore::new(roles),
        }
    }

    // ------------------------------------------------------------------
    // Whole-document operations
    // ------------------------------------------------------------------

    pub fn create(&self, account: &AccountRecord) -> Result<()> {
        self.accounts.whole_document().insert(account)?;
        tracing::debug!(id = %account.id, "account created");
        Ok(())
    }

    /// Save every field of `account`.  Changes other processes made since
    /// the copy was loaded are overwritten.
    pub fn update(&self, account: &mut AccountRecord) -> Result<bool> {
        account.concurrency_stamp = Some(Uuid::new_v4().to_string());
        self.accounts.whole_document().replace(account)
    }

    pub fn delete(&self, account: &AccountRecord) -> Result<bool> {
        self.accounts.whole_document().delete(&account.id)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn find_by_id(&self, id: &str) -> Result<Option<AccountRecord>> {
        self.accounts.find_by_id(id)
    }

    pub fn find_by_name(&self, normalized_user_name: &str) -> Result<Option<AccountRecord>> {
        self.accounts.find_one(&Filter::Eq(
            AccountRecord::NORMALIZED_USER_NAME.path()?,
            json!(normalized_user_name),
        ))
    }

    pub fn find_by_email(&self, normalized_email: &str) -> Result<Option<AccountRecord>> {
        self.accounts.find_one(&Filter::Eq(
            AccountRecord::NORMALIZED_EMAIL.path()?,
            json!(normalized_email),
        ))
    }

    pub fn find_by_login(
        &self,
        login_provider: &str,
        provider_key: &str,
    ) -> Result<Option<AccountRecord>> {
        self.accounts.find_one(&Filter::ElementMatch(
            AccountRecord::LOGINS.path()?,
            login_key(login_provider, provider_key),
        ))
    }

    pub fn accounts_for_claim(&self, claim: &Claim) -> Result<Vec<AccountRecord>> {
        self.accounts.find(&Filter::ElementMatch(
            AccountRecord::CLAIMS.path()?,
            element_key([
                ("claim_type", json!(claim.claim_type)),
                ("value", json!(claim.value)),
            ]),
        ))
    }

    pub fn accounts_in_role(&self, normalized_role_name: &str) -> Result<Vec<AccountRecord>> {
        let Some(role) = self.roles.find_by_name(normalized_role_name)? else {
            return Ok(Vec::new());
        };
        self.accounts
            .find(&Filter::Contains(AccountRecord::ROLES.path()?, json!(role.id)))
    }

    // ------------------------------------------------------------------
    // Scalar fields
    // ------------------------------------------------------------------

    pub fn user_name(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::USER_NAME, &account.user_name)
    }

    pub fn set_user_name(
        &self,
        account: &mut AccountRecord,
        user_name: Option<&str>,
    ) -> Result<()> {
        self.set_text(&account.id, AccountRecord::USER_NAME, &mut account.user_name, user_name)
    }

    pub fn normalized_user_name(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts.read_optional(
            &account.id,
            AccountRecord::NORMALIZED_USER_NAME,
            &account.normalized_user_name,
        )
    }

    pub fn set_normalized_user_name(
        &self,
        account: &mut AccountRecord,
        name: Option<&str>,
    ) -> Result<()> {
        self.set_text(
            &account.id,
            AccountRecord::NORMALIZED_USER_NAME,
            &mut account.normalized_user_name,
            name,
        )
    }

    pub fn email(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::EMAIL, &account.email)
    }

    pub fn set_email(&self, account: &mut AccountRecord, email: Option<&str>) -> Result<()> {
        self.set_text(&account.id, AccountRecord::EMAIL, &mut account.email, email)
    }

    pub fn normalized_email(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts.read_optional(
            &account.id,
            AccountRecord::NORMALIZED_EMAIL,
            &account.normalized_email,
        )
    }

    pub fn set_normalized_email(
        &self,
        account: &mut AccountRecord,
        email: Option<&str>,
    ) -> Result<()> {
        self.set_text(
            &account.id,
            AccountRecord::NORMALIZED_EMAIL,
            &mut account.normalized_email,
            email,
        )
    }

    pub fn email_confirmed(&self, account: &AccountRecord) -> Result<bool> {
        self.accounts
            .read_or(&account.id, AccountRecord::EMAIL_CONFIRMED, account.email_confirmed)
    }

    pub fn set_email_confirmed(&self, account: &mut AccountRecord, confirmed: bool) -> Result<()> {
        self.set_flag(
            &account.id,
            AccountRecord::EMAIL_CONFIRMED,
            &mut account.email_confirmed,
            confirmed,
        )
    }

    pub fn password_hash(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::PASSWORD_HASH, &account.password_hash)
    }

    pub fn set_password_hash(&self, account: &mut AccountRecord, hash: Option<&str>) -> Result<()> {
        self.set_text(&account.id, AccountRecord::PASSWORD_HASH, &mut account.password_hash, hash)
    }

    pub fn has_password(&self, account: &AccountRecord) -> Result<bool> {
        Ok(self.password_hash(account)?.is_some())
    }

    pub fn security_stamp(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::SECURITY_STAMP, &account.security_stamp)
    }

    pub fn set_security_stamp(&self, account: &mut AccountRecord, stamp: &str) -> Result<()> {
        self.set_text(
            &account.id,
            AccountRecord::SECURITY_STAMP,
            &mut account.security_stamp,
            Some(stamp),
        )
    }

    pub fn phone_number(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::PHONE_NUMBER, &account.phone_number)
    }

    pub fn set_phone_number(&self, account: &mut AccountRecord, phone: Option<&str>) -> Result<()> {
        self.set_text(&account.id, AccountRecord::PHONE_NUMBER, &mut account.phone_number, phone)
    }

    pub fn phone_number_confirmed(&self, account: &AccountRecord) -> Result<bool> {
        self.accounts.read_or(
            &account.id,
            AccountRecord::PHONE_NUMBER_CONFIRMED,
            account.phone_number_confirmed,
        )
    }

    pub fn set_phone_number_confirmed(
        &self,
        account: &mut AccountRecord,
        confirmed: bool,
    ) -> Result<()> {
        self.set_flag(
            &account.id,
            AccountRecord::PHONE_NUMBER_CONFIRMED,
            &mut account.phone_number_confirmed,
            confirmed,
        )
    }

    pub fn two_factor_enabled(&self, account: &AccountRecord) -> Result<bool> {
        self.accounts.read_or(
            &account.id,
            AccountRecord::TWO_FACTOR_ENABLED,
            account.two_factor_enabled,
        )
    }

    pub fn set_two_factor_enabled(&self, account: &mut AccountRecord, enabled: bool) -> Result<()> {
        self.set_flag(
            &account.id,
            AccountRecord::TWO_FACTOR_ENABLED,
            &mut account.two_factor_enabled,
            enabled,
        )
    }

    // ------------------------------------------------------------------
    // Lockout
    // ------------------------------------------------------------------

    pub fn lockout_end(&self, account: &AccountRecord) -> Result<Option<DateTime<Utc>>> {
        self.accounts
            .read_optional(&account.id, AccountRecord::LOCKOUT_END, &account.lockout_end)
    }

    pub fn set_lockout_end(
        &self,
        account: &mut AccountRecord,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        account.lockout_end = end;
        self.accounts
            .set_optional(&account.id, AccountRecord::LOCKOUT_END, account.lockout_end.as_ref())?;
        Ok(())
    }

    pub fn lockout_enabled(&self, account: &AccountRecord) -> Result<bool> {
        self.accounts
            .read_or(&account.id, AccountRecord::LOCKOUT_ENABLED, account.lockout_enabled)
    }

    pub fn set_lockout_enabled(&self, account: &mut AccountRecord, enabled: bool) -> Result<()> {
        self.set_flag(
            &account.id,
            AccountRecord::LOCKOUT_ENABLED,
            &mut account.lockout_enabled,
            enabled,
        )
    }

    pub fn access_failed_count(&self, account: &AccountRecord) -> Result<i32> {
        self.accounts.read_or(
            &account.id,
            AccountRecord::ACCESS_FAILED_COUNT,
            account.access_failed_count,
        )
    }

    /// Count a failed access.  The store increments atomically, so
    /// concurrent failures from several processes are all counted.
    pub fn increment_access_failed_count(&self, account: &mut AccountRecord) -> Result<i32> {
        account.access_failed_count = account.access_failed_count.saturating_add(1);
        if let Some(persisted) = self
            .accounts
            .increment(&account.id, AccountRecord::ACCESS_FAILED_COUNT, 1)?
        {
            account.access_failed_count = persisted;
        }
        Ok(account.access_failed_count)
    }

    pub fn reset_access_failed_count(&self, account: &mut AccountRecord) -> Result<()> {
        account.access_failed_count = 0;
        self.accounts
            .set_field(&account.id, AccountRecord::ACCESS_FAILED_COUNT, &0)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    pub fn claims(&self, account: &AccountRecord) -> Result<Vec<Claim>> {
        self.accounts
            .read_or(&account.id, AccountRecord::CLAIMS, account.claims.clone())
    }

    pub fn add_claims(&self, account: &mut AccountRecord, claims: &[Claim]) -> Result<()> {
        for claim in claims {
            if !account.claims.contains(claim) {
                account.claims.push(claim.clone());
            }
            self.accounts
                .add_to_set(&account.id, AccountRecord::CLAIMS, claim)?;
        }
        Ok(())
    }

    pub fn remove_claims(&self, account: &mut AccountRecord, claims: &[Claim]) -> Result<()> {
        for claim in claims {
            account.claims.retain(|c| c != claim);
            self.accounts
                .remove_from_set(&account.id, AccountRecord::CLAIMS, claim)?;
        }
        Ok(())
    }

    pub fn replace_claim(
        &self,
        account: &mut AccountRecord,
        old: &Claim,
        new: &Claim,
    ) -> Result<()> {
        if let Some(slot) = account.claims.iter_mut().find(|c| *c == old) {
            *slot = new.clone();
        }
        self.accounts
            .replace_element(&account.id, AccountRecord::CLAIMS, old, new)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // External logins
    // ------------------------------------------------------------------

    pub fn logins(&self, account: &AccountRecord) -> Result<Vec<LoginBinding>> {
        self.accounts
            .read_or(&account.id, AccountRecord::LOGINS, account.logins.clone())
    }

    /// Bind an external login.  A binding for the same provider and key is
    /// replaced.
    pub fn add_login(&self, account: &mut AccountRecord, login: LoginBinding) -> Result<()> {
        match account.logins.iter_mut().find(|l| {
            l.login_provider == login.login_provider && l.provider_key == login.provider_key
        }) {
            Some(existing) => *existing = login.clone(),
            None => account.logins.push(login.clone()),
        }

        let key = login_key(&login.login_provider, &login.provider_key);
        self.accounts
            .upsert_element(&account.id, AccountRecord::LOGINS, key, &login)?;
        Ok(())
    }

    pub fn remove_login(
        &self,
        account: &mut AccountRecord,
        login_provider: &str,
        provider_key: &str,
    ) -> Result<()> {
        account
            .logins
            .retain(|l| !(l.login_provider == login_provider && l.provider_key == provider_key));
        self.accounts.remove_matching(
            &account.id,
            AccountRecord::LOGINS,
            login_key(login_provider, provider_key),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    /// Add the account to a role, addressed by normalized role name.
    pub fn add_to_role(
        &self,
        account: &mut AccountRecord,
        normalized_role_name: &str,
    ) -> Result<()> {
        let role = self
            .roles
            .find_by_name(normalized_role_name)?
            .ok_or_else(|| StoreError::RoleNotFound(normalized_role_name.to_string()))?;

        if !account.roles.contains(&role.id) {
            account.roles.push(role.id.clone());
        }
        self.accounts
            .add_to_set(&account.id, AccountRecord::ROLES, &role.id)?;
        Ok(())
    }

    /// Remove the account from a role.  Unknown roles are ignored.
    pub fn remove_from_role(
        &self,
        account: &mut AccountRecord,
        normalized_role_name: &str,
    ) -> Result<()> {
        let Some(role) = self.roles.find_by_name(normalized_role_name)? else {
            return Ok(());
        };
        account.roles.retain(|id| *id != role.id);
        self.accounts
            .remove_from_set(&account.id, AccountRecord::ROLES, &role.id)?;
        Ok(())
    }

    /// Names of the roles the account belongs to.  Ids whose role has been
    /// deleted are skipped.
    pub fn role_names(&self, account: &AccountRecord) -> Result<Vec<String>> {
        let ids = self
            .accounts
            .read_or(&account.id, AccountRecord::ROLES, account.roles.clone())?;

        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(name) = self.roles.find_by_id(&id)?.and_then(|r| r.name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn is_in_role(&self, account: &AccountRecord, normalized_role_name: &str) -> Result<bool> {
        let Some(role) = self.roles.find_by_name(normalized_role_name)? else {
            return Ok(false);
        };
        let ids = self
            .accounts
            .read_or(&account.id, AccountRecord::ROLES, account.roles.clone())?;
        Ok(ids.contains(&role.id))
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    pub fn token(
        &self,
        account: &AccountRecord,
        login_provider: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let tokens = self
            .accounts
            .read_or(&account.id, AccountRecord::TOKENS, account.tokens.clone())?;
        Ok(tokens
            .into_iter()
            .find(|t| t.login_provider == login_provider && t.name == name)
            .map(|t| t.value))
    }

    pub fn set_token(
        &self,
        account: &mut AccountRecord,
        login_provider: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let entry = TokenEntry {
            login_provider: login_provider.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        };
        remember_token(&mut account.tokens, entry.clone());
        self.accounts.upsert_element(
            &account.id,
            AccountRecord::TOKENS,
            TokenEntry::key(login_provider, name),
            &entry,
        )?;
        Ok(())
    }

    pub fn remove_token(
        &self,
        account: &mut AccountRecord,
        login_provider: &str,
        name: &str,
    ) -> Result<()> {
        account
            .tokens
            .retain(|t| !(t.login_provider == login_provider && t.name == name));
        self.accounts.remove_matching(
            &account.id,
            AccountRecord::TOKENS,
            TokenEntry::key(login_provider, name),
        )?;
        Ok(())
    }

    pub fn authenticator_key(&self, account: &AccountRecord) -> Result<Option<String>> {
        self.token(account, INTERNAL_LOGIN_PROVIDER, AUTHENTICATOR_KEY_TOKEN)
    }

    pub fn set_authenticator_key(&self, account: &mut AccountRecord, key: &str) -> Result<()> {
        self.set_token(account, INTERNAL_LOGIN_PROVIDER, AUTHENTICATOR_KEY_TOKEN, key)
    }

    pub fn replace_recovery_codes(
        &self,
        account: &mut AccountRecord,
        codes: &[String],
    ) -> Result<()> {
        self.set_token(account, INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN, &codes.join(";"))
    }

    pub fn count_recovery_codes(&self, account: &AccountRecord) -> Result<usize> {
        Ok(self.recovery_codes(account)?.len())
    }

    /// Consume a recovery code.  Returns `false` if it is not valid.
    ///
    /// The token is rewritten only if it still holds exactly what was read,
    /// so each code is accepted once across every process sharing the
    /// store.  A concurrent change to the token makes the redemption start
    /// over from the new value.
    pub fn redeem_recovery_code(&self, account: &mut AccountRecord, code: &str) -> Result<bool> {
        let key = TokenEntry::key(INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN);
        loop {
            let stored = self
                .accounts
                .read_field(&account.id, STORED_TOKENS)?
                .unwrap_or_default();
            let Some(current) = stored.into_iter().find(|t| matches_key(t, &key)) else {
                return Ok(false);
            };

            let merged = current.get("value").and_then(Value::as_str).unwrap_or_default();
            let mut codes = split_codes(merged);
            let Some(position) = codes.iter().position(|c| c == code) else {
                return Ok(false);
            };
            codes.remove(position);
            let remaining = codes.join(";");

            let mut redeemed = current.clone();
            if let Value::Object(fields) = &mut redeemed {
                fields.insert("value".to_string(), Value::String(remaining.clone()));
            }

            let outcome = self
                .accounts
                .replace_element(&account.id, STORED_TOKENS, &current, &redeemed)?;
            if outcome.modified {
                remember_token(
                    &mut account.tokens,
                    TokenEntry::internal(RECOVERY_CODES_TOKEN, remaining),
                );
                return Ok(true);
            }
            tracing::debug!(id = %account.id, "recovery codes changed concurrently, retrying");
        }
    }

    fn recovery_codes(&self, account: &AccountRecord) -> Result<Vec<String>> {
        let merged = self
            .token(account, INTERNAL_LOGIN_PROVIDER, RECOVERY_CODES_TOKEN)?
            .unwrap_or_default();
        Ok(split_codes(&merged))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn set_text(
        &self,
        id: &str,
        field: AccountField<String>,
        slot: &mut Option<String>,
        value: Option<&str>,
    ) -> Result<()> {
        *slot = value.map(str::to_string);
        self.accounts.set_optional(id, field, slot.as_ref())?;
        Ok(())
    }

    fn set_flag(
        &self,
        id: &str,
        field: AccountField<bool>,
        slot: &mut bool,
        value: bool,
    ) -> Result<()> {
        *slot = value;
        self.accounts.set_field(id, field, &value)?;
        Ok(())
    }
}

// Same path as `AccountRecord::TOKENS`, left untyped so that stored
// elements compare exactly, including fields the record type does not know.
const STORED_TOKENS: AccountField<Vec<Value>> = Field::new("tokens");

fn remember_token(tokens: &mut Vec<TokenEntry>, entry: TokenEntry) {
    match tokens
        .iter_mut()
        .find(|t| t.login_provider == entry.login_provider && t.name == entry.name)
    {
        Some(existing) => *existing = entry,
        None => tokens.push(entry),
    }
}

fn split_codes(merged: &str) -> Vec<String> {
    merged
        .split(';')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn login_key(login_provider: &str, provider_key: &str) -> crate::update::ElementKey {
    element_key([
        ("login_provider", json!(login_provider)),
        ("provider_key", json!(provider_key)),
    ])
}
