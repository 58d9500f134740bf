//! Connection task (C11): the per-connection `Job` that couples the
//! transport handle, the auth state machine, and either the message
//! exchange (communication role) or the channel directory (connection
//! role).

use crate::auth::{AuthMachine, AuthOutcome, AuthState, ClientType};
use crate::channels;
use crate::directory::ExchangeDirectory;
use crate::exchange::{MessageExchange, TICK_FRAME_BUDGET};
use crate::frame::{
    ActorType, AuthProof, AuthRequest, AuthResult, Frame, FrameBody, FrameId, NoData, ResultCode,
};
use crate::pool::Job;
use crate::queue;
use crate::store::Store;
use crate::transport::ConnectionIo;
use relay_proto::logging::Logger;
use relay_proto::time::timestamp_secs;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Directory-only front door: authenticates, answers one channel
    /// lookup, disconnects.
    Connection,
    /// Authenticates, then relays or spools between the two peers of a
    /// device key.
    Communication,
}

pub struct ConnectionTask {
    io: ConnectionIo,
    auth: AuthMachine,
    role: Role,
    channel_id: u32,
    directory: Arc<ExchangeDirectory>,
    exchange: Option<Arc<MessageExchange>>,
    log: Logger,
}

impl ConnectionTask {
    pub fn new(
        io: ConnectionIo,
        role: Role,
        channel_id: u32,
        directory: Arc<ExchangeDirectory>,
        log: Logger,
    ) -> Self {
        ConnectionTask {
            io,
            auth: AuthMachine::new(),
            role,
            channel_id,
            directory,
            exchange: None,
            log,
        }
    }

    fn send(&self, frame: &Frame) {
        if self.io.send_frame(frame.encode()).is_err() {
            self.io.close();
        }
    }

    fn send_auth_result(&self, result: ResultCode) {
        self.send(&Frame {
            id: FrameId::AuthResult,
            body: FrameBody::AuthResult(AuthResult { result }),
        });
    }

    fn caller_actor(&self) -> ActorType {
        match self.auth.user.client_type {
            ClientType::Platform => ActorType::Platform,
            _ => ActorType::App,
        }
    }

    fn dispatch(&mut self, frame: Frame, session: &mut Store) -> bool {
        match frame.body {
            FrameBody::AuthRequest(req) => self.handle_auth_request(req, session),
            FrameBody::AuthProof(proof) => self.handle_auth_proof(proof, session),
            other => {
                if self.auth.state != AuthState::Authenticated {
                    return false;
                }
                let frame = Frame { id: frame.id, body: other };
                match self.role {
                    Role::Connection => self.handle_connection_role_frame(frame, session),
                    Role::Communication => self.handle_communication_frame(frame, session),
                }
            }
        }
    }

    fn handle_auth_request(&mut self, req: AuthRequest, session: &mut Store) -> bool {
        match self.auth.handle_auth_request(&req, session) {
            AuthOutcome::Challenge(challenge) => {
                self.send(&Frame {
                    id: FrameId::AuthChallenge,
                    body: FrameBody::AuthChallenge(challenge),
                });
                true
            }
            AuthOutcome::AlreadyOk => {
                self.send_auth_result(ResultCode::None);
                true
            }
            AuthOutcome::Retry(code) => {
                self.send_auth_result(code);
                true
            }
            AuthOutcome::Close => false,
            AuthOutcome::Authenticated => unreachable!("an auth request never authenticates directly"),
        }
    }

    fn handle_auth_proof(&mut self, proof: AuthProof, session: &mut Store) -> bool {
        match self.auth.handle_auth_proof(&proof) {
            AuthOutcome::Authenticated => {
                let result = self.admit(session);
                self.send_auth_result(result);
                result == ResultCode::None
            }
            AuthOutcome::AlreadyOk => {
                self.send_auth_result(ResultCode::None);
                true
            }
            AuthOutcome::Retry(code) => {
                self.send_auth_result(code);
                true
            }
            AuthOutcome::Close => false,
            AuthOutcome::Challenge(_) => unreachable!("a proof never re-issues a challenge"),
        }
    }

    /// Role-specific admission on successful proof (§4.6). Returns the code
    /// to report in `AUTH_RESULT`; any non-`None` code also closes the
    /// connection.
    fn admit(&mut self, session: &mut Store) -> ResultCode {
        let device_key = self.auth.user.device_key.clone();
        let user_id = self.auth.user.user_id as u64;

        match self.role {
            Role::Connection => ResultCode::None,
            Role::Communication => match self.auth.user.client_type {
                ClientType::Platform => self.admit_platform(session, user_id, &device_key),
                ClientType::App => match self.directory.take(&device_key) {
                    Some(exchange) => {
                        exchange.clear();
                        self.exchange = Some(exchange);
                        ResultCode::None
                    }
                    None => ResultCode::NoDevice,
                },
                ClientType::Unset => ResultCode::UnknownActor,
            },
        }
    }

    fn admit_platform(&mut self, session: &mut Store, user_id: u64, device_key: &str) -> ResultCode {
        match session.connection_device_channel_exists(self.channel_id, device_key) {
            Ok(true) => return ResultCode::AlreadyConnected,
            Ok(false) => {}
            Err(e) => {
                slog::error!(self.log, "channel membership lookup failed"; "error" => %e);
                return ResultCode::Generic;
            }
        }

        match self.directory.create(device_key) {
            Ok(exchange) => {
                self.exchange = Some(exchange);
                if let Err(e) = session.insert_connection_device_channel(self.channel_id, user_id, device_key) {
                    slog::error!(self.log, "failed to record channel membership"; "error" => %e);
                }
                if let Err(e) = session.increment_assistant_connections(self.channel_id) {
                    slog::error!(self.log, "failed to bump assistant_connections"; "error" => %e);
                }
                ResultCode::None
            }
            // An exchange already exists for this device key even though no
            // connection_device_channel row did; treat as the same invariant
            // violation §7 calls out (duplicate exchange for device key).
            Err(_) => ResultCode::AlreadyConnected,
        }
    }

    fn handle_connection_role_frame(&mut self, frame: Frame, session: &Store) -> bool {
        match frame.body {
            FrameBody::ChannelRequest(req) => {
                let now = timestamp_secs();
                let user_id = self.auth.user.user_id as u64;
                let response = channels::handle_channel_request(
                    session,
                    self.caller_actor(),
                    user_id,
                    &self.auth.user.device_key,
                    &req.channel,
                    now,
                );
                self.send(&Frame {
                    id: FrameId::ChannelResponse,
                    body: FrameBody::ChannelResponse(response),
                });
                // one-shot directory lookup, then disconnect.
                false
            }
            _ => true,
        }
    }

    fn handle_communication_frame(&mut self, frame: Frame, session: &mut Store) -> bool {
        match frame.body {
            FrameBody::GetData => {
                let user_id = self.auth.user.user_id as u64;
                match queue::take_incoming(session, user_id, &self.auth.user.device_key, self.caller_actor(), &self.log) {
                    Some(reply) => self.send(&reply),
                    None => self.send(&Frame {
                        id: FrameId::NoData,
                        body: FrameBody::NoData(NoData { data_type: 0 }),
                    }),
                }
                true
            }
            FrameBody::Opaque { .. } => {
                let frame = Frame { id: frame.id, body: frame.body };
                if let Some(exchange) = &self.exchange {
                    match self.auth.user.client_type {
                        ClientType::Platform => exchange.push_platform_to_app(frame),
                        _ => exchange.push_app_to_platform(frame),
                    }
                } else {
                    let user_id = self.auth.user.user_id as u64;
                    queue::store_outgoing(session, user_id, &self.auth.user.device_key, self.caller_actor(), &frame, &self.log);
                }
                true
            }
            // Synthetic PARTNER_CLOSED never legitimately arrives over the
            // wire; any other control frame is ignored once authenticated.
            _ => true,
        }
    }

    /// Pops one frame bound for this peer and forwards it, recognizing the
    /// synthetic `PARTNER_CLOSED` signal instead of relaying it verbatim.
    fn relay_outgoing(&mut self) -> bool {
        let exchange = match &self.exchange {
            Some(e) => Arc::clone(e),
            None => return true,
        };

        let outgoing = match self.auth.user.client_type {
            ClientType::Platform => exchange.pop_app_to_platform(),
            _ => exchange.pop_platform_to_app(),
        };

        let frame = match outgoing {
            Some(f) => f,
            None => return true,
        };

        if frame.id == FrameId::PartnerClosed {
            return self.handle_partner_closed(&exchange);
        }

        self.send(&frame);
        true
    }

    /// Step 4 of §4.6: a platform recycles the exchange for a new app; any
    /// other role simply terminates.
    fn handle_partner_closed(&mut self, exchange: &Arc<MessageExchange>) -> bool {
        match self.auth.user.client_type {
            ClientType::Platform => {
                exchange.clear();
                self.directory.put_back(Arc::clone(exchange));
                true
            }
            _ => false,
        }
    }

    fn teardown(&mut self, session: &mut Store) {
        if self.role != Role::Communication {
            return;
        }

        let device_key = self.auth.user.device_key.clone();
        match self.auth.user.client_type {
            ClientType::Platform => {
                // Only a platform that actually completed admission holds an
                // exchange; a second platform refused with AlreadyConnected
                // never set one, and must not touch the first platform's row
                // or counter.
                if let Some(exchange) = &self.exchange {
                    if let Err(e) = session.delete_connection_device_channel(self.channel_id, &device_key) {
                        slog::error!(self.log, "failed to delete channel membership row"; "error" => %e);
                    }
                    if let Err(e) = session.decrement_assistant_connections(self.channel_id) {
                        slog::error!(self.log, "failed to decrement assistant_connections"; "error" => %e);
                    }
                    exchange.push_platform_to_app(Frame {
                        id: FrameId::PartnerClosed,
                        body: FrameBody::PartnerClosed,
                    });
                }
            }
            ClientType::App => {
                if let Some(exchange) = &self.exchange {
                    exchange.push_app_to_platform(Frame {
                        id: FrameId::PartnerClosed,
                        body: FrameBody::PartnerClosed,
                    });
                }
            }
            ClientType::Unset => {}
        }
        self.exchange = None;
    }
}

impl Job for ConnectionTask {
    fn perform(&mut self, session: &mut Store) -> bool {
        if !self.io.is_connected() {
            self.teardown(session);
            return false;
        }

        for _ in 0..TICK_FRAME_BUDGET {
            let raw = match self.io.try_recv_frame() {
                Some(raw) => raw,
                None => break,
            };

            let frame = match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    slog::warn!(self.log, "dropping connection on malformed frame"; "error" => %e);
                    self.io.close();
                    self.teardown(session);
                    return false;
                }
            };

            if !self.dispatch(frame, session) {
                self.io.close();
                self.teardown(session);
                return false;
            }
        }

        if self.role == Role::Communication && !self.relay_outgoing() {
            self.io.close();
            self.teardown(session);
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VERSION;
    use relay_proto::crypto;

    fn test_log() -> Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn seed_account(store: &Store, mail: &str, password: &[u8], device_key: &str) -> u64 {
        let salt = crypto::random_salt();
        let key = crypto::derive_key(password, &salt).unwrap();
        let blob = crypto::encode_password_blob(&salt, &key);
        let id = store.insert_account(mail, &blob).unwrap();
        store.insert_device(id, device_key).unwrap();
        id
    }

    fn send_frame(tx: &std::sync::mpsc::Sender<Vec<u8>>, frame: &Frame) {
        tx.send(frame.encode().to_vec()).unwrap();
    }

    fn recv_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Frame {
        let bytes = rx.try_recv().unwrap();
        let mut buf = [0u8; crate::frame::FRAME_SIZE];
        buf.copy_from_slice(&bytes);
        Frame::decode(&buf).unwrap()
    }

    fn authenticate(
        task: &mut ConnectionTask,
        session: &mut Store,
        inbound_tx: &std::sync::mpsc::Sender<Vec<u8>>,
        outbound_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        mail: &str,
        password: &[u8],
        device_key: &str,
        actor: ActorType,
    ) -> ResultCode {
        send_frame(
            inbound_tx,
            &Frame {
                id: FrameId::AuthRequest,
                body: FrameBody::AuthRequest(AuthRequest {
                    mail: mail.to_string(),
                    device_key: device_key.to_string(),
                    actor,
                    version: VERSION,
                }),
            },
        );
        task.perform(session);
        let challenge = match recv_frame(outbound_rx).body {
            FrameBody::AuthChallenge(c) => c,
            other => panic!("expected challenge, got {:?}", other),
        };

        let key = crypto::derive_key(password, &challenge.salt).unwrap();
        let sealed = crypto::seal_nonce_challenge(&key, challenge.nonce);
        send_frame(
            inbound_tx,
            &Frame {
                id: FrameId::AuthProof,
                body: FrameBody::AuthProof(crate::frame::AuthProof {
                    nonce_hash: sealed,
                    device_key: device_key.to_string(),
                }),
            },
        );
        task.perform(session);
        match recv_frame(outbound_rx).body {
            FrameBody::AuthResult(r) => r.result,
            other => panic!("expected auth result, got {:?}", other),
        }
    }

    #[test]
    fn platform_authenticates_and_is_admitted() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");

        let (io, inbound_tx, mut outbound_rx) = crate::transport::ConnectionIo::test_pair();
        let directory = Arc::new(ExchangeDirectory::new());
        let mut task = ConnectionTask::new(io, Role::Communication, 1, Arc::clone(&directory), test_log());
        let mut session = store;

        let result = authenticate(
            &mut task,
            &mut session,
            &inbound_tx,
            &mut outbound_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::Platform,
        );
        assert_eq!(result, ResultCode::None);
        assert!(session.connection_device_channel_exists(1, "D1").unwrap());
        // platform keeps its own Arc; the directory holds an independent
        // clone that an app connection can later take().
        assert!(directory.take("D1").is_some());
    }

    #[test]
    fn second_app_with_no_platform_present_is_refused() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");

        let (io, inbound_tx, mut outbound_rx) = crate::transport::ConnectionIo::test_pair();
        let directory = Arc::new(ExchangeDirectory::new());
        let mut task = ConnectionTask::new(io, Role::Communication, 1, directory, test_log());
        let mut session = store;

        let result = authenticate(
            &mut task,
            &mut session,
            &inbound_tx,
            &mut outbound_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::App,
        );
        assert_eq!(result, ResultCode::NoDevice);
    }

    #[test]
    fn app_retrieves_queued_platform_message_via_get_data() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");
        store
            .insert_message(1, "D1", ActorType::Platform as u8, FrameId::Text as u8, &crypto::encode_payload(b"hi"))
            .unwrap();

        let directory = Arc::new(ExchangeDirectory::new());
        let mut session = store;

        let (platform_io, platform_tx, mut platform_rx) = crate::transport::ConnectionIo::test_pair();
        let mut platform_task =
            ConnectionTask::new(platform_io, Role::Communication, 1, Arc::clone(&directory), test_log());
        let platform_result = authenticate(
            &mut platform_task,
            &mut session,
            &platform_tx,
            &mut platform_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::Platform,
        );
        assert_eq!(platform_result, ResultCode::None);

        let (app_io, app_tx, mut app_rx) = crate::transport::ConnectionIo::test_pair();
        let mut app_task = ConnectionTask::new(app_io, Role::Communication, 1, directory, test_log());
        let app_result = authenticate(
            &mut app_task,
            &mut session,
            &app_tx,
            &mut app_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::App,
        );
        assert_eq!(app_result, ResultCode::None);

        send_frame(
            &app_tx,
            &Frame {
                id: FrameId::GetData,
                body: FrameBody::GetData,
            },
        );
        assert!(app_task.perform(&mut session));
        let reply = recv_frame(&mut app_rx);
        match reply.body {
            FrameBody::Opaque { data, .. } => assert_eq!(data, b"hi"),
            other => panic!("expected opaque TEXT frame, got {:?}", other),
        }
    }

    #[test]
    fn second_platform_refused_leaves_first_platforms_state_untouched() {
        let store = Store::open_in_memory().unwrap();
        seed_account(&store, "a@x", b"hunter2", "D1");
        store
            .upsert_channel(&crate::store::ChannelRow {
                channel_id: 1,
                name: "chan".to_string(),
                address: "10.0.0.1".to_string(),
                port: 9000,
                assistant_connections: 0,
                last_update: timestamp_secs(),
            })
            .unwrap();

        let directory = Arc::new(ExchangeDirectory::new());
        let mut session = store;

        let (first_io, first_tx, mut first_rx) = crate::transport::ConnectionIo::test_pair();
        let mut first_task =
            ConnectionTask::new(first_io, Role::Communication, 1, Arc::clone(&directory), test_log());
        let first_result = authenticate(
            &mut first_task,
            &mut session,
            &first_tx,
            &mut first_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::Platform,
        );
        assert_eq!(first_result, ResultCode::None);
        assert!(session.connection_device_channel_exists(1, "D1").unwrap());
        assert_eq!(session.channel_by_id(1).unwrap().unwrap().assistant_connections, 1);

        let (second_io, second_tx, mut second_rx) = crate::transport::ConnectionIo::test_pair();
        let mut second_task = ConnectionTask::new(second_io, Role::Communication, 1, directory, test_log());
        let second_result = authenticate(
            &mut second_task,
            &mut session,
            &second_tx,
            &mut second_rx,
            "a@x",
            b"hunter2",
            "D1",
            ActorType::Platform,
        );
        assert_eq!(second_result, ResultCode::AlreadyConnected);

        // the refused second platform never held an exchange, so its
        // teardown (triggered by the failed auth result above) must not
        // have deleted the first platform's channel membership row or
        // decremented its counter.
        assert!(session.connection_device_channel_exists(1, "D1").unwrap());
        assert_eq!(session.channel_by_id(1).unwrap().unwrap().assistant_connections, 1);
    }

    #[test]
    fn connection_role_answers_one_lookup_then_disconnects() {
        let store = Store::open_in_memory().unwrap();
        let user_id = seed_account(&store, "a@x", b"hunter2", "D1");
        store
            .upsert_channel(&crate::store::ChannelRow {
                channel_id: 5,
                name: "voice".to_string(),
                address: "10.0.0.1".to_string(),
                port: 9000,
                assistant_connections: 0,
                last_update: timestamp_secs(),
            })
            .unwrap();
        store.insert_connection_device_channel(5, user_id, "D1").unwrap();

        let (io, inbound_tx, mut outbound_rx) = crate::transport::ConnectionIo::test_pair();
        let directory = Arc::new(ExchangeDirectory::new());
        let mut task = ConnectionTask::new(io, Role::Connection, 5, directory, test_log());

        send_frame(
            &inbound_tx,
            &Frame {
                id: FrameId::AuthRequest,
                body: FrameBody::AuthRequest(AuthRequest {
                    mail: "a@x".to_string(),
                    device_key: "D1".to_string(),
                    actor: ActorType::App,
                    version: VERSION,
                }),
            },
        );
        let mut session = store;
        assert!(task.perform(&mut session));
        let challenge = match recv_frame(&mut outbound_rx).body {
            FrameBody::AuthChallenge(c) => c,
            other => panic!("expected challenge, got {:?}", other),
        };
        let key = crypto::derive_key(b"hunter2", &challenge.salt).unwrap();
        let sealed = crypto::seal_nonce_challenge(&key, challenge.nonce);
        send_frame(
            &inbound_tx,
            &Frame {
                id: FrameId::AuthProof,
                body: FrameBody::AuthProof(crate::frame::AuthProof {
                    nonce_hash: sealed,
                    device_key: "D1".to_string(),
                }),
            },
        );
        assert!(task.perform(&mut session));
        let _ = recv_frame(&mut outbound_rx); // AUTH_RESULT(NONE)

        send_frame(
            &inbound_tx,
            &Frame {
                id: FrameId::ChannelRequest,
                body: FrameBody::ChannelRequest(crate::frame::ChannelRequest {
                    channel: "voice".to_string(),
                }),
            },
        );
        assert!(!task.perform(&mut session));
        let response = match recv_frame(&mut outbound_rx).body {
            FrameBody::ChannelResponse(r) => r,
            other => panic!("expected channel response, got {:?}", other),
        };
        assert_eq!(response.result, ResultCode::None);
        assert_eq!(response.address, "10.0.0.1");
    }
}
