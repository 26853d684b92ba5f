// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Write operations.
//!
//! All registration goes through transactions; a closure registered with
//! [`StoreDb::register_valid_paths`] becomes visible atomically.

use std::collections::BTreeSet;
use std::time::SystemTime;

use rusqlite::{OptionalExtension as _, Transaction, params};
use tracing::trace;

use crate::connection::StoreDb;
use crate::error::{Error, Result};
use crate::types::system_time_to_unix;

/// Everything needed to register one valid path.
#[derive(Debug, Clone)]
pub struct RegisterPathParams {
    /// Full store path.
    pub path: String,
    /// NAR hash, rendered `sha256:<base16>`.
    pub hash: String,
    pub registration_time: SystemTime,
    /// Full path of the deriver, if known. Need not itself be valid.
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    pub ultimate: bool,
    /// Space-separated signature strings.
    pub sigs: Option<String>,
    /// Content address string, if content-addressed.
    pub ca: Option<String>,
    /// Full paths this path references. May include the path itself.
    pub references: BTreeSet<String>,
}

impl Default for RegisterPathParams {
    fn default() -> Self {
        RegisterPathParams {
            path: String::new(),
            hash: String::new(),
            registration_time: SystemTime::now(),
            deriver: None,
            nar_size: None,
            ultimate: false,
            sigs: None,
            ca: None,
            references: BTreeSet::new(),
        }
    }
}

impl StoreDb {
    /// Register one valid path. Every reference must already be valid
    /// (a self reference is allowed), otherwise
    /// [`Error::DanglingReference`].
    pub fn register_valid_path(&mut self, params: &RegisterPathParams) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let id = insert_path(&tx, params)?;
        tx.commit()?;
        Ok(id)
    }

    /// Register a whole closure in one transaction, in the given order.
    /// References may point at other paths of the same batch.
    pub fn register_valid_paths(&mut self, batch: &[RegisterPathParams]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(batch.len());
        for params in batch {
            ids.push(insert_path(&tx, params)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Remove a path. Fails with [`Error::PathInUse`] while any other
    /// path still references it.
    pub fn invalidate_path(&mut self, path: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let referrer: Option<String> = tx
            .query_row(
                r#"
                SELECT v.path
                FROM Refs r JOIN ValidPaths v ON r.referrer = v.id
                WHERE r.reference = (SELECT id FROM ValidPaths WHERE path = ?1)
                  AND v.path != ?1
                LIMIT 1
                "#,
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(referrer) = referrer {
            return Err(Error::PathInUse {
                path: path.to_owned(),
                referrer,
            });
        }
        let rows = tx.execute("DELETE FROM ValidPaths WHERE path = ?1", params![path])?;
        tx.commit()?;
        trace!(path, deleted = rows > 0, "invalidated path");
        Ok(rows > 0)
    }

    /// Record an output of a (valid) derivation.
    pub fn register_derivation_output(
        &self,
        drv_path: &str,
        output_name: &str,
        output_path: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO DerivationOutputs (drv, id, path)
            SELECT v.id, ?2, ?3 FROM ValidPaths v WHERE v.path = ?1
            "#,
            params![drv_path, output_name, output_path],
        )?;
        Ok(())
    }

    /// Append signatures (space-separated) to a path.
    pub fn add_signatures(&self, path: &str, sigs: &[String]) -> Result<()> {
        let existing: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT sigs FROM ValidPaths WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Err(Error::PathNotFound(path.to_owned()));
        };
        let mut merged: BTreeSet<String> = existing
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        merged.extend(sigs.iter().cloned());
        let joined = merged.into_iter().collect::<Vec<_>>().join(" ");
        self.conn.execute(
            "UPDATE ValidPaths SET sigs = ?2 WHERE path = ?1",
            params![path, joined],
        )?;
        Ok(())
    }

    /// Record a realisation. `drv_output` is the `sha256:<hex>!<name>`
    /// id; the output path must be valid.
    pub fn register_realisation(
        &self,
        drv_output: &str,
        output_path: &str,
        signatures: Option<&str>,
    ) -> Result<i64> {
        let (drv_hash, output_name) = drv_output
            .split_once('!')
            .ok_or_else(|| Error::PathNotFound(drv_output.to_owned()))?;
        let output_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM ValidPaths WHERE path = ?1",
                params![output_path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(output_id) = output_id else {
            return Err(Error::PathNotFound(output_path.to_owned()));
        };
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO Realisations (drvPath, outputName, outputPath, signatures)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![drv_hash, output_name, output_id, signatures],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Memoise that `successor` is the resolved form of `drv_path`.
    pub fn register_successor(&self, drv_path: &str, successor: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO Successors (drvPath, successor) VALUES (?1, ?2)",
            params![drv_path, successor],
        )?;
        Ok(())
    }
}

fn insert_path(tx: &Transaction<'_>, params: &RegisterPathParams) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM ValidPaths WHERE path = ?1",
            params![params.path],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(Error::AlreadyRegistered(params.path.clone()));
    }

    tx.execute(
        r#"
        INSERT INTO ValidPaths (path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            params.path,
            params.hash,
            system_time_to_unix(params.registration_time),
            params.deriver,
            params.nar_size.map(|n| n as i64),
            if params.ultimate { 1 } else { 0 },
            params.sigs,
            params.ca,
        ],
    )?;
    let id = tx.last_insert_rowid();

    for reference in &params.references {
        let ref_id: i64 = if *reference == params.path {
            id
        } else {
            tx.query_row(
                "SELECT id FROM ValidPaths WHERE path = ?1",
                params![reference],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::DanglingReference {
                path: params.path.clone(),
                reference: reference.clone(),
            })?
        };
        tx.execute(
            "INSERT OR REPLACE INTO Refs (referrer, reference) VALUES (?1, ?2)",
            params![id, ref_id],
        )?;
    }
    Ok(id)
}
