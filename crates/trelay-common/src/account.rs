use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Tolerant boolean used for account-level feature flags.
///
/// Account records arrive from an external service that has historically
/// stored both JSON booleans and the strings `"true"` / `"false"`. Only the
/// boolean `true` and the literal string `"true"` count as enabled; the
/// string `"false"` disables, on every path that consults the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "ToggleRepr")]
pub struct Toggle(pub bool);

impl Toggle {
    pub fn enabled(self) -> bool {
        self.0
    }

    pub fn on() -> Self {
        Toggle(true)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToggleRepr {
    Bool(bool),
    Text(String),
}

impl From<ToggleRepr> for Toggle {
    fn from(value: ToggleRepr) -> Self {
        match value {
            ToggleRepr::Bool(value) => Toggle(value),
            ToggleRepr::Text(value) => Toggle(value == "true"),
        }
    }
}

/// Upstream provider account, as served by the external account service.
///
/// The relay consumes a snapshot per request and never mutates it; writes go
/// back through [`AccountResolver`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// Absolute URL prefix, e.g. `https://api.example.com`.
    pub base_api: String,
    pub api_key: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Optional per-account outbound proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Daily spend quota in account currency; 0 disables quota tracking.
    #[serde(default)]
    pub daily_quota: f64,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub enable_translation: Toggle,
    #[serde(default)]
    pub translation_source_lang: Option<String>,
    #[serde(default)]
    pub translation_target_lang: Option<String>,
}

impl Account {
    pub fn translation_source_lang(&self) -> &str {
        self.translation_source_lang.as_deref().unwrap_or("zh")
    }

    pub fn translation_target_lang(&self) -> &str {
        self.translation_target_lang.as_deref().unwrap_or("en")
    }
}

/// Narrow contract to the external account service.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn account(&self, id: &str) -> Option<Account>;

    /// Record an upstream transport failure against the account.
    async fn mark_error(&self, id: &str, message: &str);

    /// Bump the account's last-used timestamp.
    async fn touch(&self, id: &str);

    /// Add to the account's daily quota spend.
    async fn add_quota_cost(&self, id: &str, cost: f64);
}

/// In-memory account store for standalone deployments and tests.
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryAccountStore {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|account| (account.id.clone(), account))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account);
    }
}

#[async_trait]
impl AccountResolver for MemoryAccountStore {
    async fn account(&self, id: &str) -> Option<Account> {
        self.accounts.read().await.get(id).cloned()
    }

    async fn mark_error(&self, id: &str, message: &str) {
        tracing::warn!(event = "account_error", account_id = %id, message = %message);
    }

    async fn touch(&self, _id: &str) {}

    async fn add_quota_cost(&self, _id: &str, _cost: f64) {}
}
