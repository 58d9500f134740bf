//! Admin CLI (§6.1, A5): reads stdin lines split on whitespace and
//! dispatches account/device management directly against the persistence
//! adapter, independent of the worker pool. Each command opens and drops
//! its own short-lived `Store` session.

use relay_core::store::Store;
use relay_proto::crypto;
use relay_proto::logging::Logger;
use std::io::{self, BufRead};

const MAX_PASSWORD_LEN: usize = 32;

pub fn run(store_path: &str, log: &Logger) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        dispatch(store_path, log, &words);
    }
}

fn dispatch(store_path: &str, log: &Logger, words: &[&str]) {
    let store = match Store::open(store_path) {
        Ok(store) => store,
        Err(e) => {
            slog::error!(log, "admin command could not open store"; "error" => %e);
            return;
        }
    };

    match words {
        ["createaccount", mail, password] => create_account(&store, log, mail, password),
        ["removeaccount", user_id] => remove_account(&store, log, user_id),
        ["adddevice", user_id, device_key] => add_device(&store, log, user_id, device_key),
        ["removedevice", user_id, device_key] => remove_device(&store, log, user_id, device_key),
        _ => slog::warn!(log, "unrecognized admin command"; "line" => words.join(" ")),
    }
}

fn create_account(store: &Store, log: &Logger, mail: &str, password: &str) {
    if password.len() > MAX_PASSWORD_LEN {
        slog::warn!(log, "password exceeds max length"; "mail" => mail, "max" => MAX_PASSWORD_LEN);
        return;
    }

    let salt = crypto::random_salt();
    let key = match crypto::derive_key(password.as_bytes(), &salt) {
        Ok(key) => key,
        Err(e) => {
            slog::error!(log, "failed to derive password key"; "error" => %e);
            return;
        }
    };
    let blob = crypto::encode_password_blob(&salt, &key);

    match store.insert_account(mail, &blob) {
        Ok(user_id) => slog::info!(log, "account created"; "mail" => mail, "user_id" => user_id),
        Err(e) => slog::error!(log, "failed to create account"; "mail" => mail, "error" => %e),
    }
}

fn remove_account(store: &Store, log: &Logger, user_id: &str) {
    let user_id: u64 = match user_id.parse() {
        Ok(id) => id,
        Err(_) => return slog::warn!(log, "invalid user id"; "user_id" => user_id),
    };
    match store.delete_account(user_id) {
        Ok(()) => slog::info!(log, "account removed"; "user_id" => user_id),
        Err(e) => slog::error!(log, "failed to remove account"; "user_id" => user_id, "error" => %e),
    }
}

fn add_device(store: &Store, log: &Logger, user_id: &str, device_key: &str) {
    let user_id: u64 = match user_id.parse() {
        Ok(id) => id,
        Err(_) => return slog::warn!(log, "invalid user id"; "user_id" => user_id),
    };
    match store.insert_device(user_id, device_key) {
        Ok(()) => slog::info!(log, "device added"; "user_id" => user_id, "device_key" => device_key),
        Err(e) => slog::error!(log, "failed to add device"; "user_id" => user_id, "error" => %e),
    }
}

fn remove_device(store: &Store, log: &Logger, user_id: &str, device_key: &str) {
    let user_id: u64 = match user_id.parse() {
        Ok(id) => id,
        Err(_) => return slog::warn!(log, "invalid user id"; "user_id" => user_id),
    };
    match store.delete_device(user_id, device_key) {
        Ok(()) => slog::info!(log, "device removed"; "user_id" => user_id, "device_key" => device_key),
        Err(e) => slog::error!(log, "failed to remove device"; "user_id" => user_id, "error" => %e),
    }
}
