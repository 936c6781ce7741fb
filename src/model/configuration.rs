//! Replication Configuration
//!
//! The root object persisted in every blob location: the map of named
//! views and the per-table records pointing at them.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::view::View;
use crate::error::{Error, Result};

fn default_lease_duration_secs() -> u64 {
    60
}

/// Per-table record naming the view a table replicates through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredTable {
    pub table_name: String,
    /// View name, empty for a placeholder record
    #[serde(default)]
    pub view_name: String,
    /// Serve tables with no explicit record
    #[serde(default)]
    pub use_as_default: bool,
}

impl ConfiguredTable {
    pub fn new(table_name: impl Into<String>, view_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            view_name: view_name.into(),
            use_as_default: false,
        }
    }

    /// A record that exists but names no view
    pub fn is_placeholder(&self) -> bool {
        self.view_name.is_empty()
    }
}

/// The replicated configuration object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Content id, regenerated on every successful write
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub view_map: BTreeMap<String, View>,
    #[serde(default)]
    pub table_list: Vec<ConfiguredTable>,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            id: String::new(),
            view_map: BTreeMap::new(),
            table_list: Vec::new(),
            lease_duration_secs: default_lease_duration_secs(),
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a view by name
    pub fn view(&self, view_name: &str) -> Option<&View> {
        self.view_map.get(view_name)
    }

    /// Insert or replace a view
    pub fn set_view(&mut self, view_name: impl Into<String>, view: View) {
        self.view_map.insert(view_name.into(), view);
    }

    /// Remove a view that no table references
    pub fn remove_view(&mut self, view_name: &str) -> Result<Option<View>> {
        if let Some(table) = self.table_list.iter().find(|t| t.view_name == view_name) {
            return Err(Error::InvalidArgument(format!(
                "view '{}' is still referenced by table '{}'",
                view_name, table.table_name
            )));
        }
        Ok(self.view_map.remove(view_name))
    }

    /// Names of views whose chain contains the given storage account
    pub fn views_containing(&self, storage_account_name: &str) -> Vec<&str> {
        self.view_map
            .iter()
            .filter(|(_, view)| view.contains_account(storage_account_name))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Insert or replace a table record
    ///
    /// Marking a record as default clears the flag on every other record.
    pub fn set_configured_table(&mut self, table: ConfiguredTable) {
        if table.use_as_default {
            for existing in self.table_list.iter_mut() {
                existing.use_as_default = false;
            }
        }

        match self
            .table_list
            .iter_mut()
            .find(|t| t.table_name == table.table_name)
        {
            Some(existing) => *existing = table,
            None => self.table_list.push(table),
        }
    }

    pub fn remove_configured_table(&mut self, table_name: &str) -> Option<ConfiguredTable> {
        let index = self
            .table_list
            .iter()
            .position(|t| t.table_name == table_name)?;
        Some(self.table_list.remove(index))
    }

    pub fn default_configured_table(&self) -> Option<&ConfiguredTable> {
        self.table_list.iter().find(|t| t.use_as_default)
    }

    /// The explicit record for a table, falling back to the default record
    pub fn find_configured_table(&self, table_name: &str) -> Option<&ConfiguredTable> {
        self.table_list
            .iter()
            .find(|t| t.table_name == table_name)
            .or_else(|| self.default_configured_table())
    }

    /// Check referential integrity before the configuration is persisted
    pub fn validate(&self) -> Result<()> {
        for (name, view) in &self.view_map {
            if name.is_empty() {
                return Err(Error::InvalidArgument("view name cannot be empty".into()));
            }

            let mut accounts = HashSet::new();
            for replica in &view.replica_chain {
                if replica.storage_account_name.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "view '{}' has a replica with an empty storage account name",
                        name
                    )));
                }
                if !accounts.insert(replica.storage_account_name.as_str()) {
                    return Err(Error::InvalidArgument(format!(
                        "view '{}' lists storage account '{}' more than once",
                        name, replica.storage_account_name
                    )));
                }
            }
        }

        let mut tables = HashSet::new();
        let mut defaults = 0usize;
        for table in &self.table_list {
            if table.table_name.is_empty() {
                return Err(Error::InvalidArgument("table name cannot be empty".into()));
            }
            if !tables.insert(table.table_name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "table '{}' is configured more than once",
                    table.table_name
                )));
            }
            if !table.is_placeholder() && !self.view_map.contains_key(&table.view_name) {
                return Err(Error::InvalidArgument(format!(
                    "table '{}' references unknown view '{}'",
                    table.table_name, table.view_name
                )));
            }
            if table.use_as_default {
                defaults += 1;
            }
        }

        if defaults > 1 {
            return Err(Error::InvalidArgument(format!(
                "{} tables are marked as default, at most one is allowed",
                defaults
            )));
        }

        Ok(())
    }
}
