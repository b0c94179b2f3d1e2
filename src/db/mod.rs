use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CategoryGroup, LedgerLine, UNIDENTIFIED_ESTABLISHMENT};
use crate::utils::now_rfc3339;

pub const TRANSFER_CATEGORY: &str = "Transfer";
pub const DEFAULT_COST_CENTER: &str = "operating";
const BOT_PREFIX: &str = "[BOT]";

pub struct Database {
    conn: Connection,
    cost_center: String,
}

impl Database {
    pub fn new(db_path: PathBuf) -> SqlResult<Self> {
        Self::prepare(Connection::open(db_path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> SqlResult<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> SqlResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut db = Database {
            conn,
            cost_center: DEFAULT_COST_CENTER.to_string(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Cost center stamped on every row the bot writes.
    pub fn with_cost_center(mut self, cost_center: &str) -> Self {
        self.cost_center = cost_center.to_string();
        self
    }

    fn run_migrations(&mut self) -> SqlResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let migrations = vec![
            (
                "001_create_ledger.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/001_create_ledger.sql"
                )),
            ),
            (
                "002_create_accounts.sql",
                include_str!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/migrations/002_create_accounts.sql"
                )),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                let tx = self.conn.transaction()?;
                tx.execute_batch(sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, datetime('now'))",
                    params![name],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    }

    pub fn check_connection(&self) -> SqlResult<()> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn get_categories(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM categories ORDER BY name COLLATE NOCASE")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    /// Registered accounts plus every account already used by a row.
    pub fn get_accounts(&self) -> SqlResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM accounts
             UNION
             SELECT DISTINCT account FROM transactions WHERE account != ''
             ORDER BY 1 COLLATE NOCASE",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    pub fn category_exists(&self, name: &str) -> SqlResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM categories WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn account_exists(&self, name: &str) -> SqlResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM accounts WHERE name = ?1)
                  + (SELECT COUNT(*) FROM transactions WHERE account = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn add_category(&self, name: &str) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO categories (name, created_at) VALUES (?1, ?2)",
            params![name.trim(), now_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn add_account(&self, name: &str) -> SqlResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO accounts (name, created_at) VALUES (?1, ?2)",
            params![name.trim(), now_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn insert_line(&self, line: &LedgerLine) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO transactions (
                id, date, description, account, category, cost_center, amount, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                line.id,
                line.date,
                line.description,
                line.account,
                line.category,
                line.cost_center,
                line.amount.to_string(),
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// One debit row per category. Groups whose category the ledger does
    /// not know are counted as errors and skipped.
    pub fn insert_grouped_expense(
        &self,
        date: NaiveDate,
        groups: &[CategoryGroup],
        account: &str,
        establishment: &str,
    ) -> SqlResult<(usize, usize)> {
        let mut saved_count = 0;
        let mut error_count = 0;

        for group in groups {
            if !self.category_exists(&group.category)? {
                warn!(category = %group.category, "Category does not exist in the ledger");
                error_count += 1;
                continue;
            }

            let line = LedgerLine {
                id: Uuid::new_v4().to_string(),
                date,
                description: expense_description(establishment, group),
                account: account.to_string(),
                category: group.category.clone(),
                cost_center: self.cost_center.clone(),
                amount: -group.subtotal(),
            };
            match self.insert_line(&line) {
                Ok(()) => {
                    saved_count += 1;
                    info!(category = %line.category, amount = %line.amount, "Inserted grouped expense");
                }
                Err(err) => {
                    error_count += 1;
                    warn!(category = %line.category, error = %err, "Failed to insert grouped expense");
                }
            }
        }

        Ok((saved_count, error_count))
    }

    /// Debit at the source, credit at the destination, both or neither.
    /// Returns the description both rows share.
    pub fn insert_transfer_pair(
        &self,
        date: NaiveDate,
        amount: Decimal,
        source_account: &str,
        destination_account: &str,
        description: Option<&str>,
    ) -> SqlResult<String> {
        let description = match description.map(str::trim).filter(|d| !d.is_empty()) {
            Some(text) => format!("{} {}", BOT_PREFIX, text),
            None => format!(
                "{} Transfer from {} to {}",
                BOT_PREFIX, source_account, destination_account
            ),
        };
        let amount = amount.abs();

        let tx = self.conn.unchecked_transaction()?;
        for (account, signed) in [(source_account, -amount), (destination_account, amount)] {
            tx.execute(
                "INSERT INTO transactions (
                    id, date, description, account, category, cost_center, amount, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    date,
                    description,
                    account,
                    TRANSFER_CATEGORY,
                    self.cost_center,
                    signed.to_string(),
                    now_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;

        info!(amount = %amount, source = %source_account, destination = %destination_account, "Inserted transfer");
        Ok(description)
    }

    /// Most recent transfer rows, both legs, newest first.
    pub fn recent_transfers(&self, limit: usize) -> SqlResult<Vec<LedgerLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, description, account, category, cost_center, amount
             FROM transactions
             WHERE category = ?1
             ORDER BY date DESC, created_at DESC, amount ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![TRANSFER_CATEGORY, limit as i64], map_line)?;
        rows.collect()
    }

    #[cfg(test)]
    pub fn lines_for_account(&self, account: &str) -> SqlResult<Vec<LedgerLine>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, description, account, category, cost_center, amount
             FROM transactions
             WHERE account = ?1
             ORDER BY date, created_at",
        )?;
        let rows = stmt.query_map(params![account], map_line)?;
        rows.collect()
    }

    #[cfg(test)]
    pub fn count_lines(&self) -> SqlResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
    }
}

fn expense_description(establishment: &str, group: &CategoryGroup) -> String {
    let products: Vec<&str> = group
        .items
        .iter()
        .map(|item| item.description.as_str())
        .collect();
    let establishment = establishment.trim();
    if establishment.is_empty() || establishment == UNIDENTIFIED_ESTABLISHMENT {
        format!("{} {}", BOT_PREFIX, products.join(", "))
    } else {
        format!("{} {} - {}", BOT_PREFIX, establishment, products.join(", "))
    }
}

fn map_line(row: &Row) -> SqlResult<LedgerLine> {
    let raw_amount: String = row.get(6)?;
    let amount = Decimal::from_str(&raw_amount)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(LedgerLine {
        id: row.get(0)?,
        date: row.get(1)?,
        description: row.get(2)?,
        account: row.get(3)?,
        category: row.get(4)?,
        cost_center: row.get(5)?,
        amount,
    })
}
