use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    API_URL, CONFIG_DIR, CONFIG_ENV, CONFIG_FILE, CONTENT_URL, DEFAULT_CHUNK_SIZE,
    DEFAULT_CONNECTIONS, DEFAULT_MAX_RETRIES, MIB,
};
use crate::error::TransferError;
use crate::utils::normalize_path;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Account {
    /// Short id usable as a path prefix, e.g. `0/Music`.
    pub id: String,
    pub access_token: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub current_account: Option<String>,
    pub accounts: BTreeMap<String, Account>,
    pub api_url: String,
    pub content_url: String,
    pub chunk_size_mib: u64,
    pub connections: usize,
    pub max_retries: u32,
    pub timeout_secs: Option<u64>,
    pub aria2c: String,
    pub player: String,
    pub player_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            current_account: None,
            accounts: BTreeMap::new(),
            api_url: API_URL.to_string(),
            content_url: CONTENT_URL.to_string(),
            chunk_size_mib: DEFAULT_CHUNK_SIZE / MIB,
            connections: DEFAULT_CONNECTIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: None,
            aria2c: "aria2c".to_string(),
            player: "vlc".to_string(),
            player_args: Vec::new(),
        }
    }
}

impl Config {
    /// `$DROPCTL_CONFIG`, or `config.yaml` under the user config directory.
    pub fn default_path() -> Result<PathBuf, TransferError> {
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(p));
        }
        dirs::config_dir()
            .map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE))
            .ok_or_else(|| TransferError::Config("no user config directory".into()))
    }

    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, TransferError> {
        serde_yaml::from_str(data).map_err(|e| TransferError::Config(e.to_string()))
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mib.max(1) * MIB
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn registry(&self) -> AccountRegistry {
        AccountRegistry::new(self.accounts.clone(), self.current_account.clone())
    }
}

/// Named accounts and their tokens, passed explicitly to whoever needs one.
#[derive(Clone, Debug, Default)]
pub struct AccountRegistry {
    accounts: BTreeMap<String, Account>,
    current: Option<String>,
}

impl AccountRegistry {
    pub fn new(accounts: BTreeMap<String, Account>, current: Option<String>) -> Self {
        Self { accounts, current }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.accounts.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<&Account, TransferError> {
        self.accounts
            .get(name)
            .ok_or_else(|| TransferError::UnknownAccount(name.to_string()))
    }

    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.accounts.get(name).map(|a| a.id.as_str())
    }

    fn name_for_id(&self, id: &str) -> Option<&str> {
        self.accounts
            .iter()
            .find(|(_, a)| a.id == id)
            .map(|(n, _)| n.as_str())
    }

    /// The configured current account, or the only account if there is one.
    pub fn default_account(&self) -> Result<&str, TransferError> {
        if let Some(current) = &self.current {
            return self.get(current).map(|_| current.as_str());
        }
        let mut names = self.accounts.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.as_str()),
            (None, _) => Err(TransferError::Config("no accounts configured".into())),
            _ => Err(TransferError::Config(
                "several accounts configured; set current_account or pass --account".into(),
            )),
        }
    }

    /// Picks the account for a command and strips an account prefix from `path`.
    ///
    /// A relative path whose first segment is an account name or id selects
    /// that account. Returns the account name and the normalised remote path.
    pub fn resolve(
        &self,
        requested: Option<&str>,
        path: &str,
    ) -> Result<(String, String), TransferError> {
        if let Some(name) = requested {
            self.get(name)?;
        }
        if !path.starts_with('/') {
            let (first, rest) = path.split_once('/').unwrap_or((path, ""));
            let prefixed = if self.accounts.contains_key(first) {
                Some(first)
            } else {
                self.name_for_id(first)
            };
            if let Some(name) = prefixed {
                return Ok((name.to_string(), normalize_path(rest)));
            }
        }
        let name = match requested {
            Some(name) => name,
            None => self.default_account()?,
        };
        Ok((name.to_string(), normalize_path(path)))
    }

    /// `[0]=alice, [1]=bob`
    pub fn legend(&self) -> String {
        self.accounts
            .iter()
            .map(|(name, a)| format!("[{}]={}", a.id, name))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
