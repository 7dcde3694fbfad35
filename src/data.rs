//! Test-data records fed into each iteration.
use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::Deserialize;

use crate::error::ConfigError;

/// One row of test data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub phone_number: String,
    pub token: String,
}

/// Immutable set of accounts, handed out round-robin across iterations.
#[derive(Debug)]
pub struct TestData {
    accounts: Vec<Account>,
    cursor: AtomicUsize,
}

impl TestData {
    pub fn new(accounts: Vec<Account>) -> Result<Self, ConfigError> {
        if accounts.is_empty() {
            return Err(ConfigError::EmptyTestData(PathBuf::from("<memory>")));
        }
        Ok(Self {
            accounts,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Load a CSV file with a `phoneNumber,token` header.
    pub fn from_csv_path(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let accounts = read_accounts(file)?;
        if accounts.is_empty() {
            return Err(ConfigError::EmptyTestData(path.to_owned()));
        }
        tracing::info!("Loaded {} test accounts from {}", accounts.len(), path.display());
        Self::new(accounts)
    }

    pub fn next(&self) -> &Account {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.accounts[i % self.accounts.len()]
    }
}

fn read_accounts(reader: impl Read) -> Result<Vec<Account>, ConfigError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
        .deserialize()
        .collect::<Result<Vec<Account>, _>>()
        .map_err(ConfigError::from)
}
