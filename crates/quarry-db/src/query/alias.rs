//! Per-compilation table and column aliases.
//!
//! The base table is aliased by its own name. Every joined table is keyed by
//! `(table, chain)`, where the chain is the dotted relation path that reached
//! it; the first chain to reach a table keeps the bare table name only if the
//! name is still free, later ones get `_0`, `_1`, ... suffixes. The same key
//! always returns the same alias, so select, join and filter clauses agree.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

/// Allocates table aliases for one compilation.
#[derive(Debug, Clone, Default)]
pub struct AliasGenerator {
    tables: IndexMap<(String, String), String>,
    counters: HashMap<String, usize>,
    taken: HashSet<String>,
}

impl AliasGenerator {
    /// Creates an empty generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the alias for `table` reached through `chain`.
    pub fn table_alias(&mut self, table: &str, chain: &str) -> String {
        let key = (table.to_string(), chain.to_string());
        if let Some(alias) = self.tables.get(&key) {
            return alias.clone();
        }
        let alias = if self.taken.contains(table) {
            loop {
                let n = self.counters.entry(table.to_string()).or_insert(0);
                let candidate = format!("{table}_{n}");
                *n += 1;
                if !self.taken.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            table.to_string()
        };
        self.taken.insert(alias.clone());
        self.tables.insert(key, alias.clone());
        alias
    }

    /// The alias of a computed column selected from `table_alias`.
    pub fn field_alias(table_alias: &str, field: &str) -> String {
        format!("{table_alias}_{field}")
    }

    /// Number of allocated table aliases.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns `true` if nothing was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
