//! SQLite store implementation

use crate::page::Offer;
use crate::store::traits::{OfferStore, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS offers (
    id INTEGER PRIMARY KEY,
    url TEXT NOT NULL,
    record TEXT NOT NULL
);
"#;

/// SQLite-backed offer store
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates the store at `path`
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        ",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory store (for testing)
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

impl OfferStore for SqliteStore {
    fn upsert_by_key(&mut self, key: i64, record: &Offer) -> StoreResult<bool> {
        let encoded = serde_json::to_string(record)?;
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM offers WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO offers (id, url, record) VALUES (?1, ?2, ?3)",
                    params![key, record.url, encoded],
                )?;
                Ok(true)
            }
            Some(stored) => {
                if stored != encoded {
                    tracing::warn!(
                        "Offer {} re-observed with different content; overwriting",
                        key
                    );
                    self.conn.execute(
                        "UPDATE offers SET url = ?2, record = ?3 WHERE id = ?1",
                        params![key, record.url, encoded],
                    )?;
                }
                Ok(false)
            }
        }
    }

    fn records_by_keys(&self, keys: &[i64]) -> StoreResult<Vec<Offer>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM offers WHERE id = ?1")?;
        let mut records = Vec::new();
        for key in keys {
            let encoded: Option<String> = stmt
                .query_row(params![key], |row| row.get(0))
                .optional()?;
            if let Some(encoded) = encoded {
                records.push(serde_json::from_str(&encoded)?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offer(id: i64) -> Offer {
        Offer {
            id,
            url: format!("https://cian.ru/rent/flat/{}/", id),
            description: "2-комн. квартира".to_string(),
            price: vec!["65 000 руб/мес".to_string()],
            address: vec!["Москва".to_string()],
            comment: String::new(),
        }
    }

    #[test]
    fn test_upsert_reports_new_once() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let offer = sample_offer(1);
        assert!(store.upsert_by_key(1, &offer).unwrap());
        assert!(!store.upsert_by_key(1, &offer).unwrap());
    }

    #[test]
    fn test_conflicting_record_overwrites() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let original = sample_offer(1);
        let mut changed = sample_offer(1);
        changed.price = vec!["70 000 руб/мес".to_string()];

        assert!(store.upsert_by_key(1, &original).unwrap());
        assert!(!store.upsert_by_key(1, &changed).unwrap());

        let records = store.records_by_keys(&[1]).unwrap();
        assert_eq!(records[0].price, changed.price);
    }

    #[test]
    fn test_records_by_keys_skips_missing() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        store.upsert_by_key(1, &sample_offer(1)).unwrap();
        store.upsert_by_key(3, &sample_offer(3)).unwrap();

        let records = store.records_by_keys(&[1, 2, 3]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[1].id, 3);
    }
}
