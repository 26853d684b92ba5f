// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Read queries.

use std::collections::BTreeSet;

use rusqlite::{OptionalExtension as _, params};

use crate::connection::StoreDb;
use crate::error::Result;
use crate::types::{DerivationOutputRow, PathInfoRow, RealisationRow, unix_to_system_time};

impl StoreDb {
    /// Whether `path` is registered. Cheap; safe to call concurrently.
    pub fn is_valid_path(&self, path: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM ValidPaths WHERE path = ?1 LIMIT 1")?;
        Ok(stmt.query_row(params![path], |_| Ok(())).optional()?.is_some())
    }

    /// Full metadata of a registered path, or `None`.
    pub fn query_path_info(&self, path: &str) -> Result<Option<PathInfoRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id, path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca
            FROM ValidPaths
            WHERE path = ?1
            "#,
        )?;
        let row = stmt
            .query_row(params![path], |row| {
                Ok(PathInfoRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    hash: row.get(2)?,
                    registration_time: unix_to_system_time(row.get(3)?),
                    deriver: row.get(4)?,
                    nar_size: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                    ultimate: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                    sigs: row.get(7)?,
                    ca: row.get(8)?,
                    references: BTreeSet::new(),
                })
            })
            .optional()?;
        match row {
            Some(mut info) => {
                info.references = self.references_of_id(info.id)?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// The full path whose hash part is `hash_part`, if any.
    pub fn query_path_from_hash_part(
        &self,
        store_dir: &str,
        hash_part: &str,
    ) -> Result<Option<String>> {
        let prefix = format!("{store_dir}/{hash_part}");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path FROM ValidPaths WHERE path >= ?1 LIMIT 1")?;
        let found: Option<String> = stmt
            .query_row(params![&prefix], |row| row.get(0))
            .optional()?;
        Ok(found.filter(|path| path.starts_with(&prefix)))
    }

    /// Forward references of a path.
    pub fn query_references(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.reference = v.id
            WHERE r.referrer = (SELECT id FROM ValidPaths WHERE path = ?1)
            "#,
        )?;
        collect_strings(stmt.query(params![path])?)
    }

    fn references_of_id(&self, id: i64) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.reference = v.id
            WHERE r.referrer = ?1
            "#,
        )?;
        collect_strings(stmt.query(params![id])?)
    }

    /// Reverse references: every path whose references include `path`.
    pub fn query_referrers(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r JOIN ValidPaths v ON r.referrer = v.id
            WHERE r.reference = (SELECT id FROM ValidPaths WHERE path = ?1)
            "#,
        )?;
        collect_strings(stmt.query(params![path])?)
    }

    /// Valid derivations recorded as producing `output_path`.
    pub fn query_valid_derivers(&self, output_path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM DerivationOutputs d JOIN ValidPaths v ON d.drv = v.id
            WHERE d.path = ?1
            "#,
        )?;
        collect_strings(stmt.query(params![output_path])?)
    }

    /// Recorded outputs of a derivation.
    pub fn query_derivation_outputs(&self, drv_path: &str) -> Result<Vec<DerivationOutputRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT d.drv, d.id, d.path
            FROM DerivationOutputs d JOIN ValidPaths v ON d.drv = v.id
            WHERE v.path = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![drv_path])?;
        let mut outputs = Vec::new();
        while let Some(row) = rows.next()? {
            outputs.push(DerivationOutputRow {
                drv_id: row.get(0)?,
                output_name: row.get(1)?,
                path: row.get(2)?,
            });
        }
        Ok(outputs)
    }

    /// Every registered path. Slow on large stores.
    pub fn query_all_valid_paths(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached("SELECT path FROM ValidPaths")?;
        let mut rows = stmt.query([])?;
        let mut paths = Vec::new();
        while let Some(row) = rows.next()? {
            paths.push(row.get(0)?);
        }
        Ok(paths)
    }

    /// Look up a realisation by its `DrvOutput` id string.
    pub fn query_realisation(&self, drv_output: &str) -> Result<Option<RealisationRow>> {
        let (drv_hash, output_name) = match drv_output.split_once('!') {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT r.id, r.drvPath, r.outputName, v.path, r.signatures
            FROM Realisations r JOIN ValidPaths v ON r.outputPath = v.id
            WHERE r.drvPath = ?1 AND r.outputName = ?2
            "#,
        )?;
        Ok(stmt
            .query_row(params![drv_hash, output_name], |row| {
                Ok(RealisationRow {
                    id: row.get(0)?,
                    drv_output: format!(
                        "{}!{}",
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?
                    ),
                    output_name: row.get(2)?,
                    output_path: row.get(3)?,
                    signatures: row.get(4)?,
                })
            })
            .optional()?)
    }

    /// The resolved successor of a derivation, if memoised.
    pub fn query_successor(&self, drv_path: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT successor FROM Successors WHERE drvPath = ?1")?;
        Ok(stmt
            .query_row(params![drv_path], |row| row.get(0))
            .optional()?)
    }
}

fn collect_strings(mut rows: rusqlite::Rows<'_>) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    while let Some(row) = rows.next()? {
        out.insert(row.get(0)?);
    }
    Ok(out)
}
