use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use hm_core::Error;

/// Persistent record of what an environment contains.
///
/// Lives inside the environment (`.hermit/receipt.db`) so the environment
/// is self-describing and can be reopened later.
pub struct Receipt {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledResource {
    pub name: String,
    pub version: Option<String>,
    pub content_hash: String,
    pub installed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedEntryPoint {
    pub name: String,
    pub target_path: String,
}

impl Receipt {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(|e| receipt_error("open", e))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().map_err(|e| receipt_error("open", e))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS installed_resources (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                version TEXT,
                content_hash TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entry_points (
                name TEXT PRIMARY KEY,
                target_path TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| receipt_error("initialize schema", e))
    }

    pub fn record_resource(
        &self,
        name: &str,
        version: Option<&str>,
        content_hash: &str,
    ) -> Result<(), Error> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .execute(
                "INSERT INTO installed_resources (name, version, content_hash, installed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, version, content_hash, now],
            )
            .map_err(|e| receipt_error("record resource", e))?;
        Ok(())
    }

    pub fn get_resource(&self, name: &str) -> Result<Option<InstalledResource>, Error> {
        self.conn
            .query_row(
                "SELECT name, version, content_hash, installed_at
                 FROM installed_resources WHERE name = ?1",
                params![name],
                |row| {
                    Ok(InstalledResource {
                        name: row.get(0)?,
                        version: row.get(1)?,
                        content_hash: row.get(2)?,
                        installed_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| receipt_error("query resource", e))
    }

    /// Installed resources in install order.
    pub fn list_resources(&self) -> Result<Vec<InstalledResource>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, version, content_hash, installed_at
                 FROM installed_resources ORDER BY seq",
            )
            .map_err(|e| receipt_error("prepare statement", e))?;

        let resources = stmt
            .query_map([], |row| {
                Ok(InstalledResource {
                    name: row.get(0)?,
                    version: row.get(1)?,
                    content_hash: row.get(2)?,
                    installed_at: row.get(3)?,
                })
            })
            .map_err(|e| receipt_error("query resources", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| receipt_error("collect resources", e))?;

        Ok(resources)
    }

    /// Record (or replace) the link for an entry point.
    pub fn record_entry_point(&self, name: &str, target_path: &str) -> Result<(), Error> {
        self.conn
            .execute(
                "INSERT INTO entry_points (name, target_path) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET target_path = excluded.target_path",
                params![name, target_path],
            )
            .map_err(|e| receipt_error("record entry point", e))?;
        Ok(())
    }

    pub fn list_entry_points(&self) -> Result<Vec<LinkedEntryPoint>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, target_path FROM entry_points ORDER BY name")
            .map_err(|e| receipt_error("prepare statement", e))?;

        let links = stmt
            .query_map([], |row| {
                Ok(LinkedEntryPoint {
                    name: row.get(0)?,
                    target_path: row.get(1)?,
                })
            })
            .map_err(|e| receipt_error("query entry points", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| receipt_error("collect entry points", e))?;

        Ok(links)
    }
}

fn receipt_error(action: &str, e: rusqlite::Error) -> Error {
    Error::InstallIo {
        resource: "receipt".to_string(),
        message: format!("failed to {action}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_resources_in_install_order() {
        let receipt = Receipt::in_memory().unwrap();

        receipt.record_resource("zope", Some("5.0"), "aa").unwrap();
        receipt.record_resource("attrs", None, "bb").unwrap();

        let names: Vec<String> = receipt
            .list_resources()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["zope", "attrs"]);
    }

    #[test]
    fn get_resource_returns_hash_and_version() {
        let receipt = Receipt::in_memory().unwrap();
        receipt.record_resource("six", Some("1.16.0"), "abc").unwrap();

        let six = receipt.get_resource("six").unwrap().unwrap();
        assert_eq!(six.version.as_deref(), Some("1.16.0"));
        assert_eq!(six.content_hash, "abc");
        assert!(receipt.get_resource("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_resource_insert_fails() {
        let receipt = Receipt::in_memory().unwrap();
        receipt.record_resource("six", None, "abc").unwrap();
        assert!(receipt.record_resource("six", None, "abc").is_err());
    }

    #[test]
    fn entry_point_record_is_replaced() {
        let receipt = Receipt::in_memory().unwrap();
        receipt.record_entry_point("tool", "/env/lib/a/bin/tool").unwrap();
        receipt.record_entry_point("tool", "/env/lib/b/bin/tool").unwrap();

        let links = receipt.list_entry_points().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_path, "/env/lib/b/bin/tool");
    }

    #[test]
    fn reopening_file_keeps_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("receipt.db");

        {
            let receipt = Receipt::open(&path).unwrap();
            receipt.record_resource("six", None, "abc").unwrap();
        }

        let receipt = Receipt::open(&path).unwrap();
        assert!(receipt.get_resource("six").unwrap().is_some());
    }
}
