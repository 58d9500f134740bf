//! Persistence adapter (C4): typed accessors to the five tables. Each
//! worker thread owns exactly one `Store`; sessions are never shared.

use relay_proto::error::PersistenceError;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: u64,
    pub mail_address: String,
    pub password_b64: String,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: i64,
    pub message_type: u8,
    pub message_data_b64: String,
}

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub channel_id: u32,
    pub name: String,
    pub address: String,
    pub port: u32,
    pub assistant_connections: u32,
    pub last_update: u64,
}

fn backend_err(e: rusqlite::Error) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

/// One persistence session. Opens (and, if needed, initializes) a sqlite
/// database file; blocking calls are acceptable because each worker thread
/// owns its own `Store`.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &str) -> Result<Store, PersistenceError> {
        let conn = Connection::open(path).map_err(backend_err)?;
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        Ok(Store { conn })
    }

    pub fn open_in_memory() -> Result<Store, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        Ok(Store { conn })
    }

    // --- user_account -----------------------------------------------

    pub fn find_account_by_mail(&self, mail: &str) -> Result<Option<Account>, PersistenceError> {
        self.conn
            .query_row(
                "SELECT user_id, mail_address, password_b64 FROM user_account WHERE mail_address = ?1",
                params![mail],
                |row| {
                    Ok(Account {
                        user_id: row.get::<_, i64>(0)? as u64,
                        mail_address: row.get(1)?,
                        password_b64: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(backend_err)
    }

    pub fn insert_account(&self, mail: &str, password_b64: &str) -> Result<u64, PersistenceError> {
        self.conn
            .execute(
                "INSERT INTO user_account (mail_address, password_b64) VALUES (?1, ?2)",
                params![mail, password_b64],
            )
            .map_err(backend_err)?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn delete_account(&self, user_id: u64) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "DELETE FROM user_account WHERE user_id = ?1",
                params![user_id as i64],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    // --- user_device_list ---------------------------------------------

    pub fn device_exists(&self, user_id: u64, device_key: &str) -> Result<bool, PersistenceError> {
        self.conn
            .query_row(
                "SELECT 1 FROM user_device_list WHERE user_id = ?1 AND device_key = ?2",
                params![user_id as i64, device_key],
                |_| Ok(()),
            )
            .optional()
            .map_err(backend_err)
            .map(|o| o.is_some())
    }

    pub fn insert_device(&self, user_id: u64, device_key: &str) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO user_device_list (user_id, device_key) VALUES (?1, ?2)",
                params![user_id as i64, device_key],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn delete_device(&self, user_id: u64, device_key: &str) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "DELETE FROM user_device_list WHERE user_id = ?1 AND device_key = ?2",
                params![user_id as i64, device_key],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    // --- message_data ---------------------------------------------------

    pub fn insert_message(
        &self,
        user_id: u64,
        device_key: &str,
        actor_type: u8,
        message_type: u8,
        message_data_b64: &str,
    ) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "INSERT INTO message_data (user_id, device_key, actor_type, message_type, message_data_b64)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id as i64, device_key, actor_type, message_type, message_data_b64],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn oldest_message(
        &self,
        user_id: u64,
        device_key: &str,
        sender_actor: u8,
    ) -> Result<Option<StoredMessage>, PersistenceError> {
        self.conn
            .query_row(
                "SELECT message_id, message_type, message_data_b64 FROM message_data
                 WHERE user_id = ?1 AND device_key = ?2 AND actor_type = ?3
                 ORDER BY message_id ASC LIMIT 1",
                params![user_id as i64, device_key, sender_actor],
                |row| {
                    Ok(StoredMessage {
                        message_id: row.get(0)?,
                        message_type: row.get(1)?,
                        message_data_b64: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(backend_err)
    }

    pub fn delete_message(&self, message_id: i64) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "DELETE FROM message_data WHERE message_id = ?1",
                params![message_id],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    // --- channel_list -----------------------------------------------------

    pub fn channel_by_id(&self, channel_id: u32) -> Result<Option<ChannelRow>, PersistenceError> {
        self.conn
            .query_row(
                "SELECT channel_id, name, address, port, assistant_connections, last_update
                 FROM channel_list WHERE channel_id = ?1",
                params![channel_id],
                row_to_channel,
            )
            .optional()
            .map_err(backend_err)
    }

    pub fn channels_by_name(
        &self,
        name: &str,
        min_last_update: u64,
    ) -> Result<Vec<ChannelRow>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT channel_id, name, address, port, assistant_connections, last_update
                 FROM channel_list WHERE name = ?1 AND last_update >= ?2",
            )
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![name, min_last_update as i64], row_to_channel)
            .map_err(backend_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend_err)
    }

    pub fn upsert_channel(&self, row: &ChannelRow) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "INSERT INTO channel_list (channel_id, name, address, port, assistant_connections, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(channel_id) DO UPDATE SET
                    name = excluded.name, address = excluded.address, port = excluded.port,
                    last_update = excluded.last_update",
                params![
                    row.channel_id,
                    row.name,
                    row.address,
                    row.port,
                    row.assistant_connections,
                    row.last_update as i64
                ],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn touch_channel(&self, channel_id: u32, now: u64) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "UPDATE channel_list SET last_update = ?1 WHERE channel_id = ?2",
                params![now as i64, channel_id],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn increment_assistant_connections(&self, channel_id: u32) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "UPDATE channel_list SET assistant_connections = assistant_connections + 1 WHERE channel_id = ?1",
                params![channel_id],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn decrement_assistant_connections(&self, channel_id: u32) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "UPDATE channel_list SET assistant_connections = MAX(assistant_connections - 1, 0) WHERE channel_id = ?1",
                params![channel_id],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    // --- connection_device_channel -----------------------------------

    pub fn connection_device_channel_exists(
        &self,
        channel_id: u32,
        device_key: &str,
    ) -> Result<bool, PersistenceError> {
        self.conn
            .query_row(
                "SELECT 1 FROM connection_device_channel WHERE channel_id = ?1 AND device_key = ?2",
                params![channel_id, device_key],
                |_| Ok(()),
            )
            .optional()
            .map_err(backend_err)
            .map(|o| o.is_some())
    }

    pub fn insert_connection_device_channel(
        &self,
        channel_id: u32,
        user_id: u64,
        device_key: &str,
    ) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "INSERT INTO connection_device_channel (channel_id, user_id, device_key) VALUES (?1, ?2, ?3)",
                params![channel_id, user_id as i64, device_key],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn delete_connection_device_channel(
        &self,
        channel_id: u32,
        device_key: &str,
    ) -> Result<(), PersistenceError> {
        self.conn
            .execute(
                "DELETE FROM connection_device_channel WHERE channel_id = ?1 AND device_key = ?2",
                params![channel_id, device_key],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    pub fn channel_ids_for_device(
        &self,
        user_id: u64,
        device_key: &str,
    ) -> Result<Vec<u32>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT channel_id FROM connection_device_channel WHERE user_id = ?1 AND device_key = ?2",
            )
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![user_id as i64, device_key], |row| row.get::<_, u32>(0))
            .map_err(backend_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend_err)
    }
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        channel_id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        assistant_connections: row.get(4)?,
        last_update: row.get::<_, i64>(5)? as u64,
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_account (
    user_id       INTEGER PRIMARY KEY,
    mail_address  TEXT NOT NULL UNIQUE,
    password_b64  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS user_device_list (
    user_id     INTEGER NOT NULL,
    device_key  TEXT NOT NULL,
    PRIMARY KEY (user_id, device_key)
);
CREATE TABLE IF NOT EXISTS message_data (
    message_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id           INTEGER NOT NULL,
    device_key        TEXT NOT NULL,
    actor_type        INTEGER NOT NULL,
    message_type      INTEGER NOT NULL,
    message_data_b64  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS channel_list (
    channel_id             INTEGER PRIMARY KEY,
    name                   TEXT NOT NULL,
    address                TEXT NOT NULL,
    port                   INTEGER NOT NULL,
    assistant_connections  INTEGER NOT NULL DEFAULT 0,
    last_update            INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS connection_device_channel (
    channel_id  INTEGER NOT NULL,
    user_id     INTEGER NOT NULL,
    device_key  TEXT NOT NULL,
    UNIQUE (channel_id, device_key)
);
";
