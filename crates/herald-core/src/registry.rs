//! Account registry: categorized target accounts loaded from static config.
//!
//! File format (JSON):
//!
//! ```json
//! { "categories": [
//!     { "name": "AI Research", "priority": 5, "strategy": "aggressive",
//!       "accounts": [ { "name": "Sam Altman", "handle": "sama", "notes": "OpenAI CEO" } ] }
//! ] }
//! ```

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    domain::{AccountCategory, ResponseStrategy, TargetAccount},
    Error, Result,
};

#[derive(Debug, Deserialize)]
struct RegistryFile {
    categories: Vec<CategoryEntry>,
}

#[derive(Debug, Deserialize)]
struct CategoryEntry {
    name: String,
    priority: u8,
    strategy: ResponseStrategy,
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    name: String,
    handle: String,
    #[serde(default)]
    notes: String,
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

#[derive(Clone, Debug, Default)]
pub struct AccountRegistry {
    categories: Vec<AccountCategory>,
}

impl AccountRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read accounts file {}: {e}", path.display()))
        })?;
        let registry = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            categories = registry.categories.len(),
            accounts = registry.account_count(),
            "loaded account registry"
        );
        Ok(registry)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid accounts file: {e}")))?;

        let mut categories = Vec::with_capacity(file.categories.len());
        for entry in file.categories {
            categories.push(build_category(entry)?);
        }
        Ok(Self { categories })
    }

    pub fn from_categories(categories: Vec<AccountCategory>) -> Self {
        Self { categories }
    }

    pub fn categories(&self) -> &[AccountCategory] {
        &self.categories
    }

    /// Number of valid (pollable) accounts.
    pub fn account_count(&self) -> usize {
        self.categories
            .iter()
            .map(|c| c.valid_accounts().count())
            .sum()
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<(&AccountCategory, &TargetAccount)> {
        let handle = normalize_handle(handle);
        self.categories.iter().find_map(|c| {
            c.valid_accounts()
                .find(|a| a.handle.eq_ignore_ascii_case(&handle))
                .map(|a| (c, a))
        })
    }
}

fn build_category(entry: CategoryEntry) -> Result<AccountCategory> {
    let name = entry.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Config("category with empty name".to_string()));
    }
    if !(1..=5).contains(&entry.priority) {
        return Err(Error::Config(format!(
            "category {name}: priority {} out of range 1..=5",
            entry.priority
        )));
    }

    let accounts = entry
        .accounts
        .into_iter()
        .map(|a| {
            let handle = normalize_handle(&a.handle);
            let valid = a.valid && is_plausible_handle(&handle);
            if !valid {
                warn!(category = %name, account = %a.name, handle = %a.handle, "skipping invalid account");
            }
            TargetAccount {
                name: a.name.trim().to_string(),
                handle,
                category: name.clone(),
                notes: a.notes.trim().to_string(),
                valid,
            }
        })
        .collect();

    Ok(AccountCategory {
        name,
        priority: entry.priority,
        strategy: entry.strategy,
        accounts,
    })
}

pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_string()
}

fn is_plausible_handle(h: &str) -> bool {
    !h.is_empty() && h.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "categories": [
        { "name": "AI Research", "priority": 5, "strategy": "aggressive",
          "accounts": [
            { "name": "Sam", "handle": "@sama", "notes": "OpenAI" },
            { "name": "Gone", "handle": "deleted_user", "valid": false },
            { "name": "Bad", "handle": "has space" }
          ] },
        { "name": "Ethics", "priority": 2, "strategy": "conservative",
          "accounts": [ { "name": "E", "handle": "ethicist" } ] }
      ]
    }"#;

    #[test]
    fn loads_and_normalizes_accounts() {
        let r = AccountRegistry::from_json(SAMPLE).unwrap();
        assert_eq!(r.categories().len(), 2);
        assert_eq!(r.account_count(), 2);

        let ai = &r.categories()[0];
        assert_eq!(ai.strategy, ResponseStrategy::Aggressive);
        assert_eq!(ai.accounts[0].handle, "sama");
        assert_eq!(ai.accounts[0].category, "AI Research");
        assert!(!ai.accounts[1].valid);
        assert!(!ai.accounts[2].valid);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let r = AccountRegistry::from_json(SAMPLE).unwrap();
        let (cat, acc) = r.find_by_handle("@SAMA").unwrap();
        assert_eq!(cat.name, "AI Research");
        assert_eq!(acc.name, "Sam");
        assert!(r.find_by_handle("deleted_user").is_none());
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let raw = r#"{"categories":[{"name":"X","priority":9,"strategy":"minimal","accounts":[]}]}"#;
        let err = AccountRegistry::from_json(raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let raw = r#"{"categories":[{"name":"X","priority":3,"strategy":"loud","accounts":[]}]}"#;
        assert!(matches!(
            AccountRegistry::from_json(raw),
            Err(Error::Config(_))
        ));
    }
}
