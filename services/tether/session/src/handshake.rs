//! Handshake protocol.
//!
//! Requests and outcomes are modeled as values; a `DENY` is an ordinary
//! [`HandshakeOutcome::Denied`] until the initiator turns it into
//! [`SessionError::Denied`].

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tether_wire::{command, ErrorCode, Frame, FrameHeader, WireError, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::error::{HandshakeStage, Result, SessionError};
use crate::ids::{ClientId, HandlerId};

const ID_SIZE: usize = 16;

/// Largest payload any handshake frame carries
const MAX_HANDSHAKE_PAYLOAD: usize = 2 * ID_SIZE;

/// First frame an initiator sends on a fresh socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// `NEW_CLIENT`
    NewSession,
    /// `NOT_NEW_CLIENT` + client id
    AdditionalChannel {
        /// Session to join
        client_id: ClientId,
    },
    /// `RECONNECT` + client id + handler id
    Recovery {
        /// Session of the broken channel
        client_id: ClientId,
        /// The broken channel's handler
        handler_id: HandlerId,
    },
    /// Anything else
    Unknown {
        /// Command code received, if any
        command: Option<i16>,
    },
}

impl HandshakeRequest {
    /// Encode the request frame
    pub fn to_frame(&self) -> Result<Frame> {
        let frame = match self {
            HandshakeRequest::NewSession => Frame::control(command::NEW_CLIENT)?,
            HandshakeRequest::AdditionalChannel { client_id } => Frame::with_payload(
                command::NOT_NEW_CLIENT,
                Bytes::copy_from_slice(client_id.as_bytes()),
            )?,
            HandshakeRequest::Recovery {
                client_id,
                handler_id,
            } => Frame::with_payload(command::RECONNECT, encode_session_ids(*client_id, *handler_id))?,
            HandshakeRequest::Unknown { command: Some(code) } => Frame::control(*code)?,
            HandshakeRequest::Unknown { command: None } => Frame::probe(),
        };
        Ok(frame)
    }

    /// Classify a request frame received by an acceptor
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let request = match frame.command() {
            Some(command::NEW_CLIENT) => HandshakeRequest::NewSession,
            Some(command::NOT_NEW_CLIENT) => HandshakeRequest::AdditionalChannel {
                client_id: decode_client_id(frame.payload())?,
            },
            Some(command::RECONNECT) => {
                let (client_id, handler_id) = decode_session_ids(frame.payload())?;
                HandshakeRequest::Recovery {
                    client_id,
                    handler_id,
                }
            }
            other => HandshakeRequest::Unknown { command: other },
        };
        Ok(request)
    }

    /// Stage this request opens
    pub fn stage(&self) -> Option<HandshakeStage> {
        match self {
            HandshakeRequest::NewSession => Some(HandshakeStage::NewSession),
            HandshakeRequest::AdditionalChannel { .. } => Some(HandshakeStage::AdditionalChannel),
            HandshakeRequest::Recovery { .. } => Some(HandshakeStage::Recovery),
            HandshakeRequest::Unknown { .. } => None,
        }
    }
}

/// Acceptor's reply to a [`HandshakeRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// `ACCEPT`, with the minted identifiers when there are any
    Accepted(Option<Bytes>),
    /// `DENY` carrying an error code
    Denied(i16),
}

impl HandshakeOutcome {
    /// `DENY` with a protocol error code
    pub fn deny(code: ErrorCode) -> Self {
        HandshakeOutcome::Denied(code.into())
    }

    /// Encode the reply frame
    pub fn to_frame(&self) -> Result<Frame> {
        let frame = match self {
            HandshakeOutcome::Accepted(None) => Frame::control(command::ACCEPT)?,
            HandshakeOutcome::Accepted(Some(payload)) => {
                Frame::with_payload(command::ACCEPT, payload.clone())?
            }
            HandshakeOutcome::Denied(code) => Frame::control_with_error(command::DENY, *code)?,
        };
        Ok(frame)
    }

    /// Interpret the reply read by an initiator
    pub fn from_frame(frame: Frame, stage: HandshakeStage) -> Result<Self> {
        match frame.command() {
            Some(command::ACCEPT) => Ok(HandshakeOutcome::Accepted(frame.into_payload())),
            Some(command::DENY) => Ok(HandshakeOutcome::Denied(
                frame.error().unwrap_or(tether_wire::ABSENT_CODE),
            )),
            other => Err(SessionError::UnexpectedResponse {
                stage,
                command: other,
            }),
        }
    }

    /// Payload of an `ACCEPT`, or the typed failure of a `DENY`
    pub fn accepted(self, stage: HandshakeStage) -> Result<Option<Bytes>> {
        match self {
            HandshakeOutcome::Accepted(payload) => Ok(payload),
            HandshakeOutcome::Denied(code) => Err(SessionError::Denied { stage, code }),
        }
    }
}

/// `client_id || handler_id`
pub fn encode_session_ids(client_id: ClientId, handler_id: HandlerId) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 * ID_SIZE);
    buf.put_slice(client_id.as_bytes());
    buf.put_slice(handler_id.as_bytes());
    buf.freeze()
}

/// Split a 32-byte `client_id || handler_id` payload
pub fn decode_session_ids(payload: Option<&Bytes>) -> Result<(ClientId, HandlerId)> {
    let bytes = fixed::<{ 2 * ID_SIZE }>(payload)?;
    let mut client = [0u8; ID_SIZE];
    let mut handler = [0u8; ID_SIZE];
    client.copy_from_slice(&bytes[..ID_SIZE]);
    handler.copy_from_slice(&bytes[ID_SIZE..]);
    Ok((ClientId::from_bytes(client), HandlerId::from_bytes(handler)))
}

/// Read a 16-byte client id payload
pub fn decode_client_id(payload: Option<&Bytes>) -> Result<ClientId> {
    fixed::<ID_SIZE>(payload).map(ClientId::from_bytes)
}

/// Read a 16-byte handler id payload
pub fn decode_handler_id(payload: Option<&Bytes>) -> Result<HandlerId> {
    fixed::<ID_SIZE>(payload).map(HandlerId::from_bytes)
}

fn fixed<const N: usize>(payload: Option<&Bytes>) -> Result<[u8; N]> {
    let actual = payload.map_or(0, |p| p.len());
    payload
        .and_then(|p| <[u8; N]>::try_from(p.as_ref()).ok())
        .ok_or(SessionError::MalformedIdentity {
            expected: N,
            actual,
        })
}

/// Write one frame straight to a socket that has no channel yet
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer
        .write_all(&frame.encode())
        .await
        .map_err(SessionError::from_io)
}

/// Read one frame straight from a socket that has no channel yet
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut head = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .await
        .map_err(SessionError::from_io)?;
    let header = FrameHeader::decode(&mut &head[..])?;
    let payload = match header.payload_size()? {
        None => None,
        Some(len) if len > MAX_HANDSHAKE_PAYLOAD => {
            return Err(WireError::PayloadTooLarge(len).into());
        }
        Some(len) => {
            let mut buf = vec![0u8; len];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(SessionError::from_io)?;
            Some(Bytes::from(buf))
        }
    };
    Ok(Frame::from_parts(header, payload)?)
}

/// Send `request` over an unbound channel and return the `ACCEPT` payload
async fn exchange(channel: &Channel, request: &HandshakeRequest, stage: HandshakeStage) -> Result<Option<Bytes>> {
    channel.send_frame(&request.to_frame()?).await?;
    let response = channel.receive_frame().await?;
    HandshakeOutcome::from_frame(response, stage)?.accepted(stage)
}

/// Open a new session: connect, send `NEW_CLIENT`, bind the returned ids
pub async fn open_session(endpoint: SocketAddr, config: Arc<SessionConfig>) -> Result<Arc<Channel>> {
    let channel = Channel::open(endpoint, config).await?;
    let stage = HandshakeStage::NewSession;
    let bound = async {
        let payload = exchange(&channel, &HandshakeRequest::NewSession, stage).await?;
        let (client_id, handler_id) = decode_session_ids(payload.as_ref())?;
        channel.initialize_on_client(client_id, handler_id)
    }
    .await;

    match bound {
        Ok(()) => {
            debug!("{}: session opened", channel.context());
            Ok(channel)
        }
        Err(e) => {
            error!("{}: {} handshake failed: {}", channel.context(), stage, e);
            channel.close().await;
            Err(e)
        }
    }
}

/// Open one more channel for an existing session
pub async fn open_additional_channel(
    endpoint: SocketAddr,
    client_id: ClientId,
    config: Arc<SessionConfig>,
) -> Result<Arc<Channel>> {
    let channel = Channel::open(endpoint, config).await?;
    let stage = HandshakeStage::AdditionalChannel;
    let bound = async {
        let request = HandshakeRequest::AdditionalChannel { client_id };
        let payload = exchange(&channel, &request, stage).await?;
        let handler_id = decode_handler_id(payload.as_ref())?;
        channel.initialize_on_client(client_id, handler_id)
    }
    .await;

    match bound {
        Ok(()) => {
            debug!("{}: additional channel opened", channel.context());
            Ok(channel)
        }
        Err(e) => {
            error!("{}: {} handshake failed: {}", channel.context(), stage, e);
            channel.close().await;
            Err(e)
        }
    }
}
