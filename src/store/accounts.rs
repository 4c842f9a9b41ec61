//! In-memory account directory: profiles, credit balances and mailbox
//! connections. Implements `UserStore`, `CreditLedger` and `TokenSource` over one
//! map so a debit is immediately visible to the next eligibility check.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, PipelineError};
use crate::pipeline::filter::FilterRules;
use crate::providers::TokenSource;
use crate::store::traits::{CreditLedger, UserProfile, UserStore};

/// One debit applied to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub user_id: String,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
}

/// Accounts file entry.
#[derive(Clone, Deserialize)]
pub struct AccountSeed {
    pub user_id: String,
    pub email_address: String,
    #[serde(default = "default_true")]
    pub bot_enabled: bool,
    #[serde(default)]
    pub credits_remaining: i64,
    #[serde(default)]
    pub filters: FilterRules,
    /// Gmail OAuth access token for the user's mailbox.
    pub access_token: Option<String>,
}

fn default_true() -> bool {
    true
}

/// State of a user's mailbox connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    /// Credentials were rejected; needs a new token.
    Error(String),
}

struct Account {
    profile: UserProfile,
    access_token: Option<SecretString>,
    connection: ConnectionStatus,
}

/// Keyed by user id; `BTreeMap` keeps `list_eligible` in a stable order.
#[derive(Default)]
pub struct InMemoryAccounts {
    accounts: RwLock<BTreeMap<String, Account>>,
    ledger: RwLock<Vec<LedgerEntry>>,
}

impl InMemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load accounts from a JSON array of [`AccountSeed`].
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let seeds: Vec<AccountSeed> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        let accounts = Self::new();
        for seed in seeds {
            accounts.insert_seed(seed).await;
        }
        info!(path = %path.display(), count = accounts.len().await, "Accounts loaded");
        Ok(accounts)
    }

    pub async fn insert(&self, profile: UserProfile) {
        self.insert_seed(AccountSeed {
            user_id: profile.user_id,
            email_address: profile.email_address,
            bot_enabled: profile.bot_enabled,
            credits_remaining: profile.credits_remaining,
            filters: profile.filters,
            access_token: None,
        })
        .await;
    }

    pub async fn insert_seed(&self, seed: AccountSeed) {
        let account = Account {
            profile: UserProfile {
                user_id: seed.user_id.clone(),
                email_address: seed.email_address,
                bot_enabled: seed.bot_enabled,
                credits_remaining: seed.credits_remaining,
                filters: seed.filters,
            },
            access_token: seed.access_token.map(SecretString::from),
            connection: ConnectionStatus::Active,
        };
        self.accounts.write().await.insert(seed.user_id, account);
    }

    pub async fn set_access_token(&self, user_id: &str, token: SecretString) {
        if let Some(account) = self.accounts.write().await.get_mut(user_id) {
            account.access_token = Some(token);
            account.connection = ConnectionStatus::Active;
        }
    }

    pub async fn connection_status(&self, user_id: &str) -> Option<ConnectionStatus> {
        let accounts = self.accounts.read().await;
        accounts.get(user_id).map(|a| a.connection.clone())
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Debits applied so far, oldest first.
    pub async fn ledger(&self) -> Vec<LedgerEntry> {
        self.ledger.read().await.clone()
    }
}

#[async_trait]
impl UserStore for InMemoryAccounts {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, PipelineError> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(user_id).map(|a| a.profile.clone()))
    }

    async fn list_eligible(&self) -> Result<Vec<UserProfile>, PipelineError> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .map(|a| &a.profile)
            .filter(|p| p.is_eligible())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CreditLedger for InMemoryAccounts {
    async fn balance(&self, user_id: &str) -> Result<i64, PipelineError> {
        let accounts = self.accounts.read().await;
        accounts
            .get(user_id)
            .map(|a| a.profile.credits_remaining)
            .ok_or_else(|| PipelineError::not_found("user", user_id))
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<i64, PipelineError> {
        if amount <= 0 {
            return Err(PipelineError::validation(format!(
                "debit amount must be positive, got {amount}"
            )));
        }

        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(user_id)
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;

        let balance = account.profile.credits_remaining;
        if balance < amount {
            return Err(PipelineError::InsufficientCredits {
                user_id: user_id.to_string(),
                balance,
                requested: amount,
            });
        }

        let balance_after = balance - amount;
        account.profile.credits_remaining = balance_after;
        drop(accounts);

        self.ledger.write().await.push(LedgerEntry {
            user_id: user_id.to_string(),
            amount,
            balance_after,
            description: description.to_string(),
        });
        debug!(user_id, amount, balance_after, "Credits debited");
        Ok(balance_after)
    }
}

#[async_trait]
impl TokenSource for InMemoryAccounts {
    async fn access_token(&self, user_id: &str) -> Result<SecretString, PipelineError> {
        let accounts = self.accounts.read().await;
        let account = accounts
            .get(user_id)
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;
        let token = account
            .access_token
            .clone()
            .ok_or_else(|| PipelineError::not_found("gmail connection", user_id))?;
        if let ConnectionStatus::Error(reason) = &account.connection {
            return Err(PipelineError::Authentication {
                provider: "gmail".to_string(),
                reason: format!("connection needs re-authentication: {reason}"),
            });
        }
        Ok(token)
    }

    async fn mark_connection_error(
        &self,
        user_id: &str,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(user_id)
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;
        // First reason wins.
        if account.connection == ConnectionStatus::Active {
            warn!(user_id, reason, "Mailbox connection marked as error");
            account.connection = ConnectionStatus::Error(reason.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    fn profile(user_id: &str, credits: i64, bot_enabled: bool) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            email_address: format!("{user_id}@example.com"),
            bot_enabled,
            credits_remaining: credits,
            filters: FilterRules::default(),
        }
    }

    #[tokio::test]
    async fn debit_reduces_balance_and_records_entry() {
        let accounts = InMemoryAccounts::new();
        accounts.insert(profile("u1", 3, true)).await;

        assert_eq!(accounts.debit("u1", 1, "Processed email m1").await.unwrap(), 2);
        assert_eq!(accounts.balance("u1").await.unwrap(), 2);

        let ledger = accounts.ledger().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].balance_after, 2);
        assert_eq!(ledger[0].description, "Processed email m1");
    }

    #[tokio::test]
    async fn debit_beyond_balance_is_typed() {
        let accounts = InMemoryAccounts::new();
        accounts.insert(profile("u1", 1, true)).await;

        let err = accounts.debit("u1", 2, "too much").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCredits {
                balance: 1,
                requested: 2,
                ..
            }
        ));
        assert_eq!(accounts.balance("u1").await.unwrap(), 1);
        assert!(accounts.ledger().await.is_empty());
    }

    #[tokio::test]
    async fn eligible_users_need_bot_and_credits() {
        let accounts = InMemoryAccounts::new();
        accounts.insert(profile("a", 5, true)).await;
        accounts.insert(profile("b", 0, true)).await;
        accounts.insert(profile("c", 5, false)).await;
        accounts.insert(profile("d", 1, true)).await;

        let ids: Vec<String> = accounts
            .list_eligible()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn missing_token_is_not_found() {
        let accounts = InMemoryAccounts::new();
        accounts.insert(profile("u1", 1, true)).await;
        assert!(matches!(
            accounts.access_token("u1").await,
            Err(PipelineError::NotFound { .. })
        ));

        accounts
            .set_access_token("u1", SecretString::from("ya29.token".to_string()))
            .await;
        let token = accounts.access_token("u1").await.unwrap();
        assert_eq!(token.expose_secret(), "ya29.token");
    }

    #[tokio::test]
    async fn connection_error_blocks_tokens_until_reconnected() {
        let accounts = InMemoryAccounts::new();
        accounts.insert(profile("u1", 1, true)).await;
        accounts
            .set_access_token("u1", SecretString::from("ya29.old".to_string()))
            .await;
        assert_eq!(
            accounts.connection_status("u1").await,
            Some(ConnectionStatus::Active)
        );

        accounts
            .mark_connection_error("u1", "401 Unauthorized")
            .await
            .unwrap();
        accounts
            .mark_connection_error("u1", "second rejection")
            .await
            .unwrap();
        assert_eq!(
            accounts.connection_status("u1").await,
            Some(ConnectionStatus::Error("401 Unauthorized".into()))
        );
        assert!(matches!(
            accounts.access_token("u1").await,
            Err(PipelineError::Authentication { .. })
        ));

        accounts
            .set_access_token("u1", SecretString::from("ya29.new".to_string()))
            .await;
        assert_eq!(
            accounts.access_token("u1").await.unwrap().expose_secret(),
            "ya29.new"
        );
        assert!(
            accounts
                .mark_connection_error("ghost", "nope")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn loads_accounts_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"user_id": "u1", "email_address": "u1@example.com", "credits_remaining": 10,
                  "filters": {{"exclude_domains": ["spam.com"]}}, "access_token": "tok"}},
                {{"user_id": "u2", "email_address": "u2@example.com", "bot_enabled": false}}
            ]"#
        )
        .unwrap();

        let accounts = InMemoryAccounts::load(file.path()).await.unwrap();
        assert_eq!(accounts.len().await, 2);
        let u1 = accounts.get_profile("u1").await.unwrap().unwrap();
        assert!(u1.bot_enabled);
        assert_eq!(u1.filters.exclude_domains, vec!["spam.com"]);
        let u2 = accounts.get_profile("u2").await.unwrap().unwrap();
        assert!(!u2.bot_enabled);
        assert_eq!(u2.credits_remaining, 0);
    }
}
