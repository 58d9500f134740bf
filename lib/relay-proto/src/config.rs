//! Line-based `Key=Value` configuration file parser. Deliberately hand-
//! rolled rather than built on a generic format crate — the wire format is
//! the original's own ad hoc `Key=Value` style, not TOML/JSON/YAML.

use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub server_cert_file_path: String,
    pub server_key_file_path: String,
    pub server_max_client_count: u32,
    pub server_connection_timeout_s: u64,
    pub mysql_address: String,
    pub mysql_port: u16,
    pub mysql_user: String,
    pub mysql_password: String,
    /// Historically the MySQL schema name; repurposed as the path to the
    /// sqlite database file backing the persistence adapter.
    pub mysql_database: String,
    /// This instance's own row id in `channel_list`, used by the
    /// communication role to record which instance hosts a device pairing.
    /// Not part of the original recognized key set; added because the core
    /// needs to know its own identity to maintain `connection_device_channel`.
    pub channel_id: u32,
    /// Which of the two server roles this instance plays. Also not part of
    /// the original recognized key set: a deployed instance plays exactly
    /// one role, and something has to say which.
    pub role: ServerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Connection,
    Communication,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_port: 0,
            server_cert_file_path: "/usr/share/relay/cert.crt".to_string(),
            server_key_file_path: "/usr/share/relay/key.key".to_string(),
            server_max_client_count: 1024,
            server_connection_timeout_s: 60,
            mysql_address: "localhost".to_string(),
            mysql_port: 33060,
            mysql_user: "user".to_string(),
            mysql_password: String::new(),
            mysql_database: "relay.sqlite3".to_string(),
            channel_id: 0,
            role: ServerRole::Communication,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Config> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Config {
        let mut config = Config::default();

        for line in contents.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(value) = line.strip_prefix("ServerPort=") {
                if let Ok(v) = value.parse() {
                    config.server_port = v;
                }
            } else if let Some(value) = line.strip_prefix("ServerCertFilePath=") {
                config.server_cert_file_path = value.to_string();
            } else if let Some(value) = line.strip_prefix("ServerKeyFilePath=") {
                config.server_key_file_path = value.to_string();
            } else if let Some(value) = line.strip_prefix("ServerMaxClientCount=") {
                if let Ok(v) = value.parse() {
                    config.server_max_client_count = v;
                }
            } else if let Some(value) = line.strip_prefix("ServerConnectionTimeoutS=") {
                if let Ok(v) = value.parse() {
                    config.server_connection_timeout_s = v;
                }
            } else if let Some(value) = line.strip_prefix("MySQLAddress=") {
                config.mysql_address = value.to_string();
            } else if let Some(value) = line.strip_prefix("MySQLPort=") {
                if let Ok(v) = value.parse() {
                    config.mysql_port = v;
                }
            } else if let Some(value) = line.strip_prefix("MySQLUser=") {
                config.mysql_user = value.to_string();
            } else if let Some(value) = line.strip_prefix("MySQLPassword=") {
                config.mysql_password = value.to_string();
            } else if let Some(value) = line.strip_prefix("MySQLDatabase=") {
                config.mysql_database = value.to_string();
            } else if let Some(value) = line.strip_prefix("ChannelId=") {
                if let Ok(v) = value.parse() {
                    config.channel_id = v;
                }
            } else if let Some(value) = line.strip_prefix("ServerRole=") {
                config.role = match value {
                    "connection" => ServerRole::Connection,
                    "communication" => ServerRole::Communication,
                    _ => config.role,
                };
            }
            // Unrecognized keys are ignored.
        }

        config
    }
}
