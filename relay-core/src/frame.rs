//! Fixed-schema wire frame codec (C2). Every frame on the wire is exactly
//! 1024 bytes; byte 0 is the identifier, the remainder is identifier-
//! specific and zero-padded.

use byteorder::{ByteOrder, LittleEndian};
use relay_proto::error::ProtocolError;

pub const FRAME_SIZE: usize = 1024;

pub const MAIL_FIELD_SIZE: usize = 256;
pub const DEVICE_KEY_FIELD_SIZE: usize = 64;
pub const SALT_FIELD_SIZE: usize = 16;
pub const NONCE_HASH_FIELD_SIZE: usize = 44;
pub const CHANNEL_NAME_FIELD_SIZE: usize = 64;
pub const ADDRESS_FIELD_SIZE: usize = 256;

pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameId {
    Unk = 0,
    PartnerClosed = 1,
    AuthRequest = 2,
    AuthChallenge = 3,
    AuthProof = 4,
    AuthResult = 5,
    PairRequest = 6,
    PairChallenge = 7,
    PairProof = 8,
    PairResult = 9,
    ChannelRequest = 10,
    ChannelResponse = 11,
    Text = 12,
    Location = 13,
    Notification = 14,
    GetData = 15,
    NoData = 16,
    CustomC = 17,
    CustomCs = 18,
}

impl FrameId {
    pub fn from_u8(value: u8) -> Result<FrameId, ProtocolError> {
        use FrameId::*;
        Ok(match value {
            0 => Unk,
            1 => PartnerClosed,
            2 => AuthRequest,
            3 => AuthChallenge,
            4 => AuthProof,
            5 => AuthResult,
            6 => PairRequest,
            7 => PairChallenge,
            8 => PairProof,
            9 => PairResult,
            10 => ChannelRequest,
            11 => ChannelResponse,
            12 => Text,
            13 => Location,
            14 => Notification,
            15 => GetData,
            16 => NoData,
            17 => CustomC,
            18 => CustomCs,
            other => return Err(ProtocolError::UnknownFrame(other)),
        })
    }

    /// Whether this identifier carries an opaque application payload that
    /// the core never interprets, as opposed to one of the structured
    /// auth/channel/store-and-forward control frames.
    pub fn is_opaque_payload(self) -> bool {
        matches!(
            self,
            FrameId::PairRequest
                | FrameId::PairChallenge
                | FrameId::PairProof
                | FrameId::PairResult
                | FrameId::Text
                | FrameId::Location
                | FrameId::Notification
                | FrameId::CustomC
                | FrameId::CustomCs
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorType {
    App = 0,
    Platform = 1,
}

impl ActorType {
    pub fn from_u8(value: u8) -> Result<ActorType, ProtocolError> {
        match value {
            0 => Ok(ActorType::App),
            1 => Ok(ActorType::Platform),
            _ => Err(ProtocolError::Malformed("unknown actor type")),
        }
    }

    pub fn opposite(self) -> ActorType {
        match self {
            ActorType::App => ActorType::Platform,
            ActorType::Platform => ActorType::App,
        }
    }
}

/// Wire-level result codes carried in `AUTH_RESULT.result` and
/// `CHANNEL_RESPONSE.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    None = 0,
    Unk = 1,
    Generic = 2,
    NoDevice = 3,
    Version = 4,
    UnknownActor = 5,
    Account = 6,
    AlreadyConnected = 7,
    Maintenance = 8,
    NoChannel = 9,
    ChannelFull = 10,
    NoPlatform = 11,
    PairFail = 12,
}

fn write_fixed(buf: &mut [u8], data: &[u8]) {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

fn read_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub mail: String,
    pub device_key: String,
    pub actor: ActorType,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub salt: [u8; SALT_FIELD_SIZE],
    pub nonce: u32,
    pub hash_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProof {
    pub nonce_hash: [u8; NONCE_HASH_FIELD_SIZE],
    pub device_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResult {
    pub result: ResultCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelResponse {
    pub channel: String,
    pub address: String,
    pub port: u32,
    pub result: ResultCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoData {
    pub data_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    PartnerClosed,
    AuthRequest(AuthRequest),
    AuthChallenge(AuthChallenge),
    AuthProof(AuthProof),
    AuthResult(AuthResult),
    ChannelRequest(ChannelRequest),
    ChannelResponse(ChannelResponse),
    GetData,
    NoData(NoData),
    /// `PAIR_*`, `TEXT`, `LOCATION`, `NOTIFICATION`, `CUSTOM_C`, `CUSTOM_CS`
    /// — application payloads the core relays or spools without ever
    /// inspecting their contents.
    Opaque { id: FrameId, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: FrameId,
    pub body: FrameBody,
}

impl Frame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = self.id as u8;
        let tail = &mut buf[1..];

        match &self.body {
            FrameBody::PartnerClosed | FrameBody::GetData => {}
            FrameBody::AuthRequest(req) => {
                write_fixed(&mut tail[0..MAIL_FIELD_SIZE], req.mail.as_bytes());
                write_fixed(
                    &mut tail[MAIL_FIELD_SIZE..MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE],
                    req.device_key.as_bytes(),
                );
                tail[MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE] = req.actor as u8;
                tail[MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE + 1] = req.version;
            }
            FrameBody::AuthChallenge(chal) => {
                tail[0..SALT_FIELD_SIZE].copy_from_slice(&chal.salt);
                LittleEndian::write_u32(&mut tail[SALT_FIELD_SIZE..SALT_FIELD_SIZE + 4], chal.nonce);
                tail[SALT_FIELD_SIZE + 4] = chal.hash_type;
            }
            FrameBody::AuthProof(proof) => {
                tail[0..NONCE_HASH_FIELD_SIZE].copy_from_slice(&proof.nonce_hash);
                write_fixed(
                    &mut tail[NONCE_HASH_FIELD_SIZE..NONCE_HASH_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE],
                    proof.device_key.as_bytes(),
                );
            }
            FrameBody::AuthResult(res) => {
                tail[0] = res.result as u8;
            }
            FrameBody::ChannelRequest(req) => {
                write_fixed(&mut tail[0..CHANNEL_NAME_FIELD_SIZE], req.channel.as_bytes());
            }
            FrameBody::ChannelResponse(res) => {
                write_fixed(&mut tail[0..CHANNEL_NAME_FIELD_SIZE], res.channel.as_bytes());
                write_fixed(
                    &mut tail[CHANNEL_NAME_FIELD_SIZE..CHANNEL_NAME_FIELD_SIZE + ADDRESS_FIELD_SIZE],
                    res.address.as_bytes(),
                );
                let port_off = CHANNEL_NAME_FIELD_SIZE + ADDRESS_FIELD_SIZE;
                LittleEndian::write_u32(&mut tail[port_off..port_off + 4], res.port);
                tail[port_off + 4] = res.result as u8;
            }
            FrameBody::NoData(nd) => {
                tail[0] = nd.data_type;
            }
            FrameBody::Opaque { data, .. } => {
                let len = data.len().min(tail.len());
                write_fixed(&mut tail[0..len], data);
            }
        }

        buf
    }

    pub fn decode(buf: &[u8; FRAME_SIZE]) -> Result<Frame, ProtocolError> {
        let id = FrameId::from_u8(buf[0])?;
        let tail = &buf[1..];

        let body = match id {
            FrameId::Unk => return Err(ProtocolError::UnknownFrame(0)),
            FrameId::PartnerClosed => FrameBody::PartnerClosed,
            FrameId::GetData => FrameBody::GetData,
            FrameId::AuthRequest => {
                if tail.len() < MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE + 2 {
                    return Err(ProtocolError::Malformed("auth request truncated"));
                }
                let mail = read_fixed_str(&tail[0..MAIL_FIELD_SIZE]);
                let device_key =
                    read_fixed_str(&tail[MAIL_FIELD_SIZE..MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE]);
                let actor = ActorType::from_u8(tail[MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE])?;
                let version = tail[MAIL_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE + 1];
                FrameBody::AuthRequest(AuthRequest {
                    mail,
                    device_key,
                    actor,
                    version,
                })
            }
            FrameId::AuthChallenge => {
                let mut salt = [0u8; SALT_FIELD_SIZE];
                salt.copy_from_slice(&tail[0..SALT_FIELD_SIZE]);
                let nonce = LittleEndian::read_u32(&tail[SALT_FIELD_SIZE..SALT_FIELD_SIZE + 4]);
                let hash_type = tail[SALT_FIELD_SIZE + 4];
                FrameBody::AuthChallenge(AuthChallenge {
                    salt,
                    nonce,
                    hash_type,
                })
            }
            FrameId::AuthProof => {
                let mut nonce_hash = [0u8; NONCE_HASH_FIELD_SIZE];
                nonce_hash.copy_from_slice(&tail[0..NONCE_HASH_FIELD_SIZE]);
                let device_key = read_fixed_str(
                    &tail[NONCE_HASH_FIELD_SIZE..NONCE_HASH_FIELD_SIZE + DEVICE_KEY_FIELD_SIZE],
                );
                FrameBody::AuthProof(AuthProof {
                    nonce_hash,
                    device_key,
                })
            }
            FrameId::AuthResult => FrameBody::AuthResult(AuthResult {
                result: decode_result_code(tail[0])?,
            }),
            FrameId::ChannelRequest => FrameBody::ChannelRequest(ChannelRequest {
                channel: read_fixed_str(&tail[0..CHANNEL_NAME_FIELD_SIZE]),
            }),
            FrameId::ChannelResponse => {
                let channel = read_fixed_str(&tail[0..CHANNEL_NAME_FIELD_SIZE]);
                let address = read_fixed_str(
                    &tail[CHANNEL_NAME_FIELD_SIZE..CHANNEL_NAME_FIELD_SIZE + ADDRESS_FIELD_SIZE],
                );
                let port_off = CHANNEL_NAME_FIELD_SIZE + ADDRESS_FIELD_SIZE;
                let port = LittleEndian::read_u32(&tail[port_off..port_off + 4]);
                let result = decode_result_code(tail[port_off + 4])?;
                FrameBody::ChannelResponse(ChannelResponse {
                    channel,
                    address,
                    port,
                    result,
                })
            }
            FrameId::NoData => FrameBody::NoData(NoData { data_type: tail[0] }),
            other => {
                let end = tail.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
                FrameBody::Opaque {
                    id: other,
                    data: tail[..end].to_vec(),
                }
            }
        };

        Ok(Frame { id, body })
    }

    pub fn opaque(id: FrameId, data: Vec<u8>) -> Frame {
        Frame {
            id,
            body: FrameBody::Opaque { id, data },
        }
    }
}

fn decode_result_code(value: u8) -> Result<ResultCode, ProtocolError> {
    use ResultCode::*;
    Ok(match value {
        0 => None,
        1 => Unk,
        2 => Generic,
        3 => NoDevice,
        4 => Version,
        5 => UnknownActor,
        6 => Account,
        7 => AlreadyConnected,
        8 => Maintenance,
        9 => NoChannel,
        10 => ChannelFull,
        11 => NoPlatform,
        12 => PairFail,
        _ => return Err(ProtocolError::Malformed("unknown result code")),
    })
}
