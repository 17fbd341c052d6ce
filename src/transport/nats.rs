use async_nats::{Client, HeaderMap};
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DuplexChannel, Metadata, Outbound, Transport};
use crate::error::TransportError;
use crate::protocol::{
    AudioFrame, AudioFrameMessage, ChatMessage, FileChunk, FileChunkMessage, FileTransferRequest,
    FileTransferResponse,
};

/// Header naming the channel on the `open` announcement
pub const CHANNEL_ID_HEADER: &str = "Channel-Id";

/// Header marking a terminal message; value is `OK` or an error code
pub const STATUS_HEADER: &str = "Status";

/// Header carrying a human-readable detail next to `Status`
pub const STATUS_DETAIL_HEADER: &str = "Status-Detail";

const STATUS_OK: &str = "OK";
const STATUS_CANCELLED: &str = "CANCELLED";

const CHAT_METHOD: &str = "chat";
const AUDIO_METHOD: &str = "audio";
const FILE_METHOD: &str = "file";
const REQUEST_TRANSFER_METHOD: &str = "transfer.request";
const RESPOND_TRANSFER_METHOD: &str = "transfer.respond";

/// Duplex channels mapped onto NATS subjects
///
/// For a channel `id` of method `m` on service `s`:
/// - `s.m.open` announces the channel, metadata carried as headers
/// - `s.m.id.up` carries our items, a `Status: OK` message closes the send side
/// - `s.m.id.down` carries server items, a `Status` header ends the sequence
///
/// Unary calls publish to `s.m` with a reply inbox and wait for one answer.
pub struct NatsTransport {
    client: Client,
    service: String,
}

impl NatsTransport {
    /// Connect to NATS server
    pub async fn connect(url: &str, service: impl Into<String>) -> Result<Self, TransportError> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to connect to {}: {}", url, e)))?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            service: service.into(),
        })
    }

    async fn open<Out, In>(
        &self,
        method: &'static str,
        mut outbound: Outbound<Out>,
        metadata: Metadata,
        encode: fn(&Out) -> anyhow::Result<Vec<u8>>,
        decode: fn(&[u8]) -> anyhow::Result<In>,
    ) -> Result<DuplexChannel<In>, TransportError>
    where
        Out: Send + 'static,
        In: Send + 'static,
    {
        let channel_id = uuid::Uuid::new_v4().to_string();
        let up = format!("{}.{}.{}.up", self.service, method, channel_id);
        let down = format!("{}.{}.{}.down", self.service, method, channel_id);

        // Subscribe before announcing so no server reply is missed
        let mut subscriber = self
            .client
            .subscribe(down.clone())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to subscribe to {}: {}", down, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CHANNEL_ID_HEADER, channel_id.as_str());
        for (key, value) in &metadata {
            headers.insert(key.as_str(), value.as_str());
        }

        self.client
            .publish_with_headers(format!("{}.{}.open", self.service, method), headers, Vec::new().into())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to open {} channel: {}", method, e)))?;

        info!("Opened {} channel {}", method, channel_id);

        let cancel = CancellationToken::new();

        // Send pump: drive the outbound sequence until it ends or we are cancelled
        let client = self.client.clone();
        let pump_cancel = cancel.clone();
        let pump_subject = up;
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break STATUS_CANCELLED,
                    item = outbound.next() => match item {
                        Some(item) => {
                            let payload = match encode(&item) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    error!("Failed to encode outbound {} item: {}", method, e);
                                    continue;
                                }
                            };
                            if let Err(e) = client.publish(pump_subject.clone(), payload.into()).await {
                                warn!("Failed to publish to {}: {}", pump_subject, e);
                            }
                        }
                        None => break STATUS_OK,
                    },
                }
            };

            let mut headers = HeaderMap::new();
            headers.insert(STATUS_HEADER, status);
            if let Err(e) = client
                .publish_with_headers(pump_subject.clone(), headers, Vec::new().into())
                .await
            {
                debug!("Failed to publish end of {}: {}", pump_subject, e);
            }
            debug!("Send side of {} closed ({})", pump_subject, status);
        });

        let recv_cancel = cancel.clone();
        let inbound = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = recv_cancel.cancelled() => None,
                    msg = subscriber.next() => Some(msg),
                };

                let msg = match next {
                    None => {
                        yield Err(TransportError::Cancelled);
                        break;
                    }
                    Some(None) => {
                        yield Err(TransportError::Unavailable("subscription closed".to_string()));
                        break;
                    }
                    Some(Some(msg)) => msg,
                };

                if let Some(status) = msg.headers.as_ref().and_then(|h| h.get(STATUS_HEADER)) {
                    let status = status.as_str().to_string();
                    if status != STATUS_OK {
                        let detail = msg
                            .headers
                            .as_ref()
                            .and_then(|h| h.get(STATUS_DETAIL_HEADER))
                            .map(|d| d.as_str().to_string())
                            .unwrap_or_default();
                        yield Err(TransportError::from_status(&status, detail));
                    }
                    break;
                }

                match decode(&msg.payload) {
                    Ok(item) => yield Ok(item),
                    Err(e) => warn!("Dropping undecodable {} message: {}", method, e),
                }
            }
        };

        Ok(DuplexChannel::new(Box::pin(inbound), cancel))
    }

    /// One request, one reply. A `Status` header other than `OK` on the reply is an error.
    async fn call<Req, Resp>(&self, method: &str, body: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let subject = format!("{}.{}", self.service, method);
        let payload = serde_json::to_vec(body)
            .map_err(|e| TransportError::Other(format!("failed to encode {} request: {}", method, e)))?;

        let inbox = self.client.new_inbox();
        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to subscribe to {}: {}", inbox, e)))?;

        self.client
            .publish_with_reply(subject.clone(), inbox, payload.into())
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to publish to {}: {}", subject, e)))?;

        debug!("Waiting for reply on {}", subject);
        let reply = replies
            .next()
            .await
            .ok_or_else(|| TransportError::Unavailable(format!("no reply to {}", subject)))?;

        if let Some(status) = reply.headers.as_ref().and_then(|h| h.get(STATUS_HEADER)) {
            if status.as_str() != STATUS_OK {
                let detail = reply
                    .headers
                    .as_ref()
                    .and_then(|h| h.get(STATUS_DETAIL_HEADER))
                    .map(|d| d.as_str().to_string())
                    .unwrap_or_default();
                return Err(TransportError::from_status(status.as_str(), detail));
            }
        }

        serde_json::from_slice(&reply.payload)
            .map_err(|e| TransportError::Other(format!("undecodable reply to {}: {}", method, e)))
    }
}

fn encode_chat(msg: &ChatMessage) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

fn decode_chat(payload: &[u8]) -> anyhow::Result<ChatMessage> {
    Ok(serde_json::from_slice(payload)?)
}

fn encode_audio(frame: &AudioFrame) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&AudioFrameMessage::from(frame))?)
}

fn decode_audio(payload: &[u8]) -> anyhow::Result<AudioFrame> {
    serde_json::from_slice::<AudioFrameMessage>(payload)?.into_frame()
}

fn encode_chunk(chunk: &FileChunk) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&FileChunkMessage::from(chunk))?)
}

fn decode_chunk(payload: &[u8]) -> anyhow::Result<FileChunk> {
    serde_json::from_slice::<FileChunkMessage>(payload)?.into_chunk()
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn open_chat(
        &self,
        outbound: Outbound<ChatMessage>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<ChatMessage>, TransportError> {
        self.open(CHAT_METHOD, outbound, metadata, encode_chat, decode_chat).await
    }

    async fn open_audio(
        &self,
        outbound: Outbound<AudioFrame>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<AudioFrame>, TransportError> {
        self.open(AUDIO_METHOD, outbound, metadata, encode_audio, decode_audio).await
    }

    async fn request_file_transfer(
        &self,
        request: FileTransferRequest,
    ) -> Result<FileTransferResponse, TransportError> {
        info!("Offering {} to {} ({})", request.filename, request.recipient, request.transfer_id);
        self.call(REQUEST_TRANSFER_METHOD, &request).await
    }

    async fn respond_file_transfer(&self, response: FileTransferResponse) -> Result<(), TransportError> {
        let _echo: FileTransferResponse = self.call(RESPOND_TRANSFER_METHOD, &response).await?;
        Ok(())
    }

    async fn open_file_transfer(
        &self,
        outbound: Outbound<FileChunk>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<FileChunk>, TransportError> {
        self.open(FILE_METHOD, outbound, metadata, encode_chunk, decode_chunk).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}
