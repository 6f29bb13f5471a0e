//! SQLite alias store
//!
//! Persists the alias -> concept id mapping and the concept metadata of one
//! knowledge base source so later runs can skip parsing the source corpus.
//!
//! Author: hephaex@gmail.com

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use taxo_core::{Concept, Result, TaxoError};
use tracing::info;

/// Host parameters per `IN (...)` query, below SQLite's default limit
const LOOKUP_CHUNK: usize = 900;

const SCHEMA: &str = "
CREATE TABLE alias_to_concepts (
    alias TEXT PRIMARY KEY NOT NULL,
    concept_ids TEXT NOT NULL
);
CREATE TABLE concepts (
    concept_id TEXT PRIMARY KEY NOT NULL,
    canonical_name TEXT NOT NULL,
    aliases TEXT NOT NULL,
    types TEXT NOT NULL,
    definition TEXT
);
";

// ============================================================================
// Alias Index
// ============================================================================

/// Alias -> concept ids, in first-seen order
///
/// The canonical name counts as an alias. An alias shared by several
/// concepts lists them in the order their records appear in the source.
pub fn alias_index(concepts: &[Concept]) -> Vec<(String, Vec<String>)> {
    let mut entries: Vec<(String, Vec<String>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for concept in concepts {
        let names = std::iter::once(&concept.canonical_name).chain(concept.aliases.iter());
        for alias in names {
            if alias.trim().is_empty() {
                continue;
            }
            let position = *positions.entry(alias.clone()).or_insert_with(|| {
                entries.push((alias.clone(), Vec::new()));
                entries.len() - 1
            });
            let ids = &mut entries[position].1;
            if !ids.contains(&concept.concept_id) {
                ids.push(concept.concept_id.clone());
            }
        }
    }
    entries
}

// ============================================================================
// Store
// ============================================================================

/// Read-only handle on a built alias store
///
/// A SQLite connection must not be shared between threads; call
/// [`AliasStore::reopen`] to give each worker its own handle.
pub struct AliasStore {
    conn: Connection,
    path: PathBuf,
}

impl std::fmt::Debug for AliasStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasStore").field("path", &self.path).finish()
    }
}

fn storage_error(context: &str) -> impl Fn(rusqlite::Error) -> TaxoError + '_ {
    move |e| TaxoError::StorageError(format!("{context}: {e}"))
}

impl AliasStore {
    /// Open an existing store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TaxoError::NotFound(format!(
                "Alias store {}",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| TaxoError::StorageError(format!("Failed to open {}: {e}", path.display())))?;

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('alias_to_concepts', 'concepts')",
                [],
                |row| row.get(0),
            )
            .map_err(storage_error("Failed to inspect alias store"))?;
        if tables != 2 {
            return Err(TaxoError::StorageError(format!(
                "{} is not an alias store",
                path.display()
            )));
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Build a store from parsed concepts
    ///
    /// The database is written next to its final location and renamed into
    /// place once complete, so an interrupted build never leaves a store that
    /// [`AliasStore::open`] would accept.
    pub fn create(path: impl AsRef<Path>, concepts: &[Concept]) -> Result<Self> {
        let path = path.as_ref();
        let started = std::time::Instant::now();
        let tmp = path.with_extension("db.tmp");
        if tmp.exists() {
            std::fs::remove_file(&tmp).map_err(|e| {
                TaxoError::StorageError(format!("Failed to remove {}: {e}", tmp.display()))
            })?;
        }

        let index = alias_index(concepts);
        {
            let mut conn = Connection::open(&tmp).map_err(|e| {
                TaxoError::StorageError(format!("Failed to create {}: {e}", tmp.display()))
            })?;
            conn.execute_batch(SCHEMA)
                .map_err(storage_error("Failed to create schema"))?;

            let tx = conn
                .transaction()
                .map_err(storage_error("Failed to begin transaction"))?;
            {
                let mut insert_alias = tx
                    .prepare("INSERT INTO alias_to_concepts (alias, concept_ids) VALUES (?1, ?2)")
                    .map_err(storage_error("Failed to prepare alias insert"))?;
                for (alias, ids) in &index {
                    let ids = serde_json::to_string(ids).map_err(|e| {
                        TaxoError::StorageError(format!("Failed to encode ids: {e}"))
                    })?;
                    insert_alias
                        .execute(params![alias, ids])
                        .map_err(storage_error("Failed to insert alias"))?;
                }

                let mut insert_concept = tx
                    .prepare(
                        "INSERT INTO concepts (concept_id, canonical_name, aliases, types, definition) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(storage_error("Failed to prepare concept insert"))?;
                for concept in concepts {
                    let aliases = serde_json::to_string(&concept.aliases).map_err(|e| {
                        TaxoError::StorageError(format!("Failed to encode aliases: {e}"))
                    })?;
                    let types = serde_json::to_string(&concept.types).map_err(|e| {
                        TaxoError::StorageError(format!("Failed to encode types: {e}"))
                    })?;
                    insert_concept
                        .execute(params![
                            concept.concept_id,
                            concept.canonical_name,
                            aliases,
                            types,
                            concept.definition
                        ])
                        .map_err(storage_error("Failed to insert concept"))?;
                }
            }
            tx.commit().map_err(storage_error("Failed to commit alias store"))?;
        }

        std::fs::rename(&tmp, path).map_err(|e| {
            TaxoError::StorageError(format!(
                "Failed to move {} to {}: {e}",
                tmp.display(),
                path.display()
            ))
        })?;

        info!(
            path = %path.display(),
            aliases = index.len(),
            concepts = concepts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built alias store"
        );
        Self::open(path)
    }

    /// Open a fresh connection on the same database
    pub fn reopen(&self) -> Result<Self> {
        Self::open(&self.path)
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Batched alias lookup
    ///
    /// Aliases are bound as query parameters, never spliced into SQL. Aliases
    /// absent from the store are absent from the result.
    pub fn lookup(&self, aliases: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = aliases.iter().filter(|a| seen.insert(a.as_str())).collect();

        let mut found = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT alias, concept_ids FROM alias_to_concepts WHERE alias IN ({placeholders})"
            );
            let mut stmt = self
                .conn
                .prepare_cached(&sql)
                .map_err(storage_error("Failed to prepare alias lookup"))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage_error("Failed to query aliases"))?;

            for row in rows {
                let (alias, ids) = row.map_err(storage_error("Failed to read alias row"))?;
                let ids: Vec<String> = serde_json::from_str(&ids).map_err(|e| {
                    TaxoError::StorageError(format!("Corrupt concept ids for '{alias}': {e}"))
                })?;
                found.insert(alias, ids);
            }
        }
        Ok(found)
    }

    /// Batched concept metadata lookup by raw id
    pub fn concepts(&self, concept_ids: &[String]) -> Result<HashMap<String, Concept>> {
        let mut seen = HashSet::new();
        let unique: Vec<&String> = concept_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .collect();

        let mut found = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT concept_id, canonical_name, aliases, types, definition \
                 FROM concepts WHERE concept_id IN ({placeholders})"
            );
            let mut stmt = self
                .conn
                .prepare_cached(&sql)
                .map_err(storage_error("Failed to prepare concept lookup"))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .map_err(storage_error("Failed to query concepts"))?;

            for row in rows {
                let (concept_id, canonical_name, aliases, types, definition) =
                    row.map_err(storage_error("Failed to read concept row"))?;
                let corrupt = |e: serde_json::Error| {
                    TaxoError::StorageError(format!("Corrupt concept '{concept_id}': {e}"))
                };
                let concept = Concept {
                    aliases: serde_json::from_str(&aliases).map_err(corrupt)?,
                    types: serde_json::from_str(&types).map_err(corrupt)?,
                    concept_id: concept_id.clone(),
                    canonical_name,
                    definition,
                };
                found.insert(concept_id, concept);
            }
        }
        Ok(found)
    }

    /// Every alias, in the order it was first seen in the source
    pub fn aliases(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT alias FROM alias_to_concepts ORDER BY rowid")
            .map_err(storage_error("Failed to prepare alias scan"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_error("Failed to scan aliases"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_error("Failed to read alias"))
    }

    /// The full mapping, ordered by alias
    pub fn alias_map(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let aliases = self.aliases()?;
        Ok(self.lookup(&aliases)?.into_iter().collect())
    }

    /// Number of stored concepts
    pub fn concept_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM concepts", [], |row| row.get(0))
            .map_err(storage_error("Failed to count concepts"))?;
        Ok(count as usize)
    }
}
