//! Challenge-response auth state machine (C5): `Fresh -> AwaitingProof ->
//! Authenticated | Rejected`.

use crate::frame::{ActorType, AuthChallenge, AuthProof, AuthRequest, ResultCode, VERSION};
use crate::store::Store;
use relay_proto::crypto;
use zeroize::Zeroizing;

/// Cumulative failed-proof budget before the connection is silently closed.
pub const ATTEMPT_BUDGET: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Unset,
    App,
    Platform,
}

impl From<ActorType> for ClientType {
    fn from(actor: ActorType) -> Self {
        match actor {
            ActorType::App => ClientType::App,
            ActorType::Platform => ClientType::Platform,
        }
    }
}

/// Mutable per-connection identity record. `password_key` is zeroized on
/// every terminal failure path and on drop.
pub struct UserInfo {
    pub user_id: u32,
    pub device_key: String,
    pub client_type: ClientType,
    pub authenticated: bool,
    password_key: Zeroizing<[u8; crypto::KEY_SIZE]>,
    pub challenge_nonce: u32,
}

impl Default for UserInfo {
    fn default() -> Self {
        UserInfo {
            user_id: 0,
            device_key: String::new(),
            client_type: ClientType::Unset,
            authenticated: false,
            password_key: Zeroizing::new([0u8; crypto::KEY_SIZE]),
            challenge_nonce: 0,
        }
    }
}

impl UserInfo {
    fn zeroize(&mut self) {
        *self.password_key = [0u8; crypto::KEY_SIZE];
        self.challenge_nonce = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Fresh,
    AwaitingProof,
    Authenticated,
    Rejected,
}

/// What the connection task should do in response to an auth-class frame.
pub enum AuthOutcome {
    /// Send `AUTH_CHALLENGE` and stay in `AwaitingProof`.
    Challenge(AuthChallenge),
    /// Proof verified; send `AUTH_RESULT(NONE)` and proceed to role admission.
    Authenticated,
    /// Already authenticated; send `AUTH_RESULT(NONE)` without touching storage.
    AlreadyOk,
    /// Send `AUTH_RESULT(code)` and remain connected (state returns to `Fresh`).
    Retry(ResultCode),
    /// Budget exhausted or unrecoverable: close the connection, no reply.
    Close,
}

pub struct AuthMachine {
    pub state: AuthState,
    attempts: u8,
    pub user: UserInfo,
}

impl AuthMachine {
    pub fn new() -> Self {
        AuthMachine {
            state: AuthState::Fresh,
            attempts: 0,
            user: UserInfo::default(),
        }
    }

    pub fn handle_auth_request(&mut self, req: &AuthRequest, store: &Store) -> AuthOutcome {
        if self.state == AuthState::Authenticated {
            return AuthOutcome::AlreadyOk;
        }

        if req.version != VERSION {
            return AuthOutcome::Retry(ResultCode::Version);
        }

        let account = match store.find_account_by_mail(&req.mail) {
            Ok(Some(account)) => account,
            Ok(None) => return AuthOutcome::Retry(ResultCode::Account),
            Err(_) => return AuthOutcome::Retry(ResultCode::Generic),
        };

        let (salt, key) = match crypto::decode_password_blob(&account.password_b64) {
            Ok(pair) => pair,
            Err(_) => return AuthOutcome::Retry(ResultCode::Account),
        };

        match store.device_exists(account.user_id, &req.device_key) {
            Ok(true) => {}
            Ok(false) => return AuthOutcome::Retry(ResultCode::NoDevice),
            Err(_) => return AuthOutcome::Retry(ResultCode::Generic),
        }

        let nonce = crypto::random_nonce32();

        self.user.user_id = account.user_id as u32;
        self.user.device_key = req.device_key.clone();
        self.user.client_type = req.actor.into();
        *self.user.password_key = key;
        self.user.challenge_nonce = nonce;
        self.state = AuthState::AwaitingProof;

        AuthOutcome::Challenge(AuthChallenge {
            salt,
            nonce,
            hash_type: 0,
        })
    }

    pub fn handle_auth_proof(&mut self, proof: &AuthProof) -> AuthOutcome {
        if self.state == AuthState::Authenticated {
            return AuthOutcome::AlreadyOk;
        }
        if self.state != AuthState::AwaitingProof {
            return AuthOutcome::Retry(ResultCode::Generic);
        }

        let ok = crypto::verify_nonce_challenge(
            &self.user.password_key,
            &proof.nonce_hash,
            self.user.challenge_nonce,
        );

        if ok {
            self.state = AuthState::Authenticated;
            self.attempts = 0;
            return AuthOutcome::Authenticated;
        }

        self.attempts += 1;
        self.user.zeroize();

        if self.attempts >= ATTEMPT_BUDGET {
            self.state = AuthState::Rejected;
            AuthOutcome::Close
        } else {
            self.state = AuthState::Fresh;
            AuthOutcome::Retry(ResultCode::Account)
        }
    }
}

impl Drop for AuthMachine {
    fn drop(&mut self) {
        self.user.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ActorType;

    fn seed_account(store: &Store, mail: &str, password: &[u8], device_key: &str) -> u64 {
        let salt = crypto::random_salt();
        let key = crypto::derive_key(password, &salt).unwrap();
        let blob = crypto::encode_password_blob(&salt, &key);
        let id = store.insert_account(mail, &blob).unwrap();
        store.insert_device(id, device_key).unwrap();
        id
    }

    #[test]
    fn happy_path_auth_succeeds() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");

        let mut machine = AuthMachine::new();
        let challenge = match machine.handle_auth_request(
            &AuthRequest {
                mail: "a@x".to_string(),
                device_key: "D1".to_string(),
                actor: ActorType::Platform,
                version: VERSION,
            },
            &store,
        ) {
            AuthOutcome::Challenge(c) => c,
            _ => panic!("expected challenge"),
        };
        assert_eq!(machine.state, AuthState::AwaitingProof);

        let salt = challenge.salt;
        let key = crypto::derive_key(b"hunter2", &salt).unwrap();
        let sealed = crypto::seal_nonce_challenge(&key, challenge.nonce);

        let outcome = machine.handle_auth_proof(&AuthProof {
            nonce_hash: sealed,
            device_key: "D1".to_string(),
        });
        assert!(matches!(outcome, AuthOutcome::Authenticated));
        assert_eq!(machine.state, AuthState::Authenticated);
    }

    #[test]
    fn wrong_password_closes_after_three_failures() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");

        let mut machine = AuthMachine::new();
        let req = AuthRequest {
            mail: "a@x".to_string(),
            device_key: "D1".to_string(),
            actor: ActorType::Platform,
            version: VERSION,
        };

        for i in 0..3 {
            let challenge = match machine.handle_auth_request(&req, &store) {
                AuthOutcome::Challenge(c) => c,
                _ => panic!("expected challenge"),
            };
            let wrong_key = crypto::derive_key(b"not it", &challenge.salt).unwrap();
            let sealed = crypto::seal_nonce_challenge(&wrong_key, challenge.nonce);
            let outcome = machine.handle_auth_proof(&AuthProof {
                nonce_hash: sealed,
                device_key: "D1".to_string(),
            });
            if i < 2 {
                assert!(matches!(outcome, AuthOutcome::Retry(ResultCode::Account)));
                assert_eq!(machine.state, AuthState::Fresh);
            } else {
                assert!(matches!(outcome, AuthOutcome::Close));
                assert_eq!(machine.state, AuthState::Rejected);
            }
        }
    }

    #[test]
    fn duplicate_auth_request_once_authenticated_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");
        let mut machine = AuthMachine::new();
        let req = AuthRequest {
            mail: "a@x".to_string(),
            device_key: "D1".to_string(),
            actor: ActorType::Platform,
            version: VERSION,
        };
        let challenge = match machine.handle_auth_request(&req, &store) {
            AuthOutcome::Challenge(c) => c,
            _ => panic!(),
        };
        let key = crypto::derive_key(b"hunter2", &challenge.salt).unwrap();
        let sealed = crypto::seal_nonce_challenge(&key, challenge.nonce);
        machine.handle_auth_proof(&AuthProof {
            nonce_hash: sealed,
            device_key: "D1".to_string(),
        });

        assert!(matches!(
            machine.handle_auth_request(&req, &store),
            AuthOutcome::AlreadyOk
        ));
    }
}
