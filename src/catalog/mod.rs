//! Diagnostic query catalog -- the fixed set of named DMV queries.

use crate::error::SentryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

// Embedded default catalog
const BUILTIN_CATALOG_TOML: &str = include_str!("default.toml");

/// What executing the query does on the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Read-only SELECT returning rows worth archiving.
    #[default]
    Statistics,
    /// Creates or starts a tracing session. Privileged, never scheduled.
    TraceSession,
}

/// Ordering of the metric column: which way is "worse".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Larger values are worse (top-N by cost).
    #[default]
    Descending,
    /// Smaller values are worse.
    Ascending,
}

/// Cost the query itself imposes on the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlags {
    #[serde(default)]
    pub recompile: bool,
    #[serde(default)]
    pub large_scan: bool,
}

/// A named diagnostic query. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticQuery {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub kind: QueryKind,
    pub target_dmv: String,
    pub sql: String,
    /// Column compared between runs, e.g. "Avg IO".
    #[serde(default)]
    pub metric: Option<String>,
    /// Column aligning rows across runs, e.g. a query hash.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub risk: RiskFlags,
    #[serde(default)]
    pub expected_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    query: Vec<DiagnosticQuery>,
}

/// Catalog of diagnostic queries keyed by id, in declaration order.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    entries: Vec<DiagnosticQuery>,
    index: HashMap<String, usize>,
}

impl QueryCatalog {
    /// Build a catalog, rejecting duplicate ids.
    pub fn from_queries(queries: Vec<DiagnosticQuery>) -> Result<Self, SentryError> {
        let mut index = HashMap::with_capacity(queries.len());
        for (pos, q) in queries.iter().enumerate() {
            if q.id.trim().is_empty() {
                return Err(SentryError::Config(format!("catalog entry #{} has an empty id", pos + 1)));
            }
            if q.sql.trim().is_empty() {
                return Err(SentryError::Config(format!("query '{}' has no SQL text", q.id)));
            }
            if index.insert(q.id.clone(), pos).is_some() {
                return Err(SentryError::DuplicateId(q.id.clone()));
            }
        }
        Ok(Self { entries: queries, index })
    }

    /// Parse a catalog from TOML text (`[[query]]` tables).
    pub fn from_toml(text: &str) -> Result<Self, SentryError> {
        let file: CatalogFile = toml::from_str(text)
            .map_err(|e| SentryError::Config(format!("invalid catalog: {}", e)))?;
        Self::from_queries(file.query)
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, SentryError> {
        Self::from_toml(BUILTIN_CATALOG_TOML)
    }

    /// Load a catalog file from disk.
    pub fn load(path: &Path) -> Result<Self, SentryError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SentryError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_toml(&text)?;
        info!(path=%path.display(), queries=catalog.len(), "Loaded query catalog");
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Result<&DiagnosticQuery, SentryError> {
        self.index
            .get(id)
            .map(|&pos| &self.entries[pos])
            .ok_or_else(|| SentryError::QueryNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &DiagnosticQuery> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(id: &str) -> DiagnosticQuery {
        DiagnosticQuery {
            id: id.to_string(),
            title: String::new(),
            kind: QueryKind::Statistics,
            target_dmv: "sys.dm_exec_query_stats".to_string(),
            sql: "SELECT 1".to_string(),
            metric: Some("Avg IO".to_string()),
            identity: Some("query_hash".to_string()),
            direction: SortDirection::Descending,
            risk: RiskFlags::default(),
            expected_columns: vec![],
        }
    }

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = QueryCatalog::builtin().unwrap();
        assert!(catalog.len() >= 9);
        let top_io = catalog.get("top-io").unwrap();
        assert_eq!(top_io.metric.as_deref(), Some("Avg IO"));
        assert_eq!(top_io.identity.as_deref(), Some("query_hash"));
        assert_eq!(top_io.direction, SortDirection::Descending);
    }

    #[test]
    fn test_builtin_ids_are_distinct() {
        let catalog = QueryCatalog::builtin().unwrap();
        let mut ids: Vec<&str> = catalog.iter().map(|q| q.id.as_str()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_builtin_flags_recompile_and_trace_session() {
        let catalog = QueryCatalog::builtin().unwrap();
        assert!(catalog.get("top-io-plans").unwrap().risk.recompile);
        assert_eq!(
            catalog.get("xe-slow-queries-session").unwrap().kind,
            QueryKind::TraceSession
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = QueryCatalog::from_queries(vec![query("top-io"), query("top-cpu"), query("top-io")])
            .unwrap_err();
        assert!(matches!(err, SentryError::DuplicateId(id) if id == "top-io"));
    }

    #[test]
    fn test_blank_sql_rejected() {
        let mut q = query("top-io");
        q.sql = "   ".to_string();
        assert!(matches!(
            QueryCatalog::from_queries(vec![q]),
            Err(SentryError::Config(_))
        ));
    }

    #[test]
    fn test_lookup_and_declaration_order() {
        let catalog =
            QueryCatalog::from_queries(vec![query("zeta"), query("alpha"), query("mid")]).unwrap();
        let order: Vec<&str> = catalog.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
        assert!(catalog.get("alpha").is_ok());
        assert!(matches!(catalog.get("missing"), Err(SentryError::QueryNotFound(_))));
    }

    #[test]
    fn test_from_toml_defaults() {
        let catalog = QueryCatalog::from_toml(
            r#"
            [[query]]
            id = "counters"
            target_dmv = "sys.dm_os_performance_counters"
            sql = "SELECT counter_name, cntr_value FROM sys.dm_os_performance_counters"
            "#,
        )
        .unwrap();
        let q = catalog.get("counters").unwrap();
        assert_eq!(q.kind, QueryKind::Statistics);
        assert!(q.metric.is_none());
        assert!(!q.risk.recompile);
    }
}
