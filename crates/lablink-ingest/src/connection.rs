//! # Connection Handler
//!
//! One task per accepted socket. The task owns the framing codec and the
//! record decoder for its listener's protocol and drives the pipeline:
//! read, frame, decode, map, persist, acknowledge.
//!
//! ## Acknowledgement discipline
//! A frame (ASTM) or message (HL7) that completes a decoded message is
//! only acknowledged after `store_message` has committed. Until then the
//! task does not read further bytes, so an analyzer can never outrun the
//! store and lose results across a crash.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use lablink_core::{
    AnalyzerType, AppEvent, CanonicalMessage, EventBus, MessageSummary, WireProtocol,
};
use lablink_db::{Database, DbError};

use crate::astm::{self, AstmCodec, AstmEvent};
use crate::decoder::{AstmDecoder, Hl7Decoder};
use crate::error::IngestError;
use crate::mapper::{self, FieldMap};
use crate::mllp::{AckCode, MllpCodec, MllpEvent};

/// Attempts at a failing store write before the connection gives up.
const PERSIST_ATTEMPTS: u32 = 3;

/// Pause between store write attempts.
const PERSIST_BACKOFF: Duration = Duration::from_millis(200);

// =============================================================================
// Context & Close Reasons
// =============================================================================

/// Everything a connection task needs, passed explicitly; there is no
/// global config or logger.
#[derive(Clone)]
pub struct ConnectionContext {
    pub port: u16,
    pub analyzer: AnalyzerType,
    pub protocol: WireProtocol,
    pub field_map: FieldMap,
    pub db: Database,
    pub events: EventBus,
    pub idle_timeout: Duration,
    /// Application name echoed in HL7 acknowledgements.
    pub app_name: String,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket normally.
    PeerClosed,
    /// Socket error (reset, broken pipe).
    PeerReset(String),
    /// No bytes for the configured idle window.
    IdleTimeout,
    /// Supervisor cancelled the connection (reload or shutdown).
    Cancelled,
    /// Three consecutive rejected frames.
    NakStorm,
    /// The store kept failing; closing so the analyzer retransmits.
    PersistenceFailure,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::PeerReset(e) => write!(f, "peer reset: {}", e),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Cancelled => write!(f, "cancelled"),
            CloseReason::NakStorm => write!(f, "repeated rejected frames"),
            CloseReason::PersistenceFailure => write!(f, "persistence failure"),
        }
    }
}

// =============================================================================
// Connection Task
// =============================================================================

enum Session {
    Astm {
        codec: AstmCodec,
        decoder: AstmDecoder,
    },
    Hl7 {
        codec: MllpCodec,
    },
}

/// Runs one client connection to completion and returns why it ended.
pub async fn run_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
    mut cancel: watch::Receiver<bool>,
) -> CloseReason {
    info!(%peer, port = ctx.port, protocol = %ctx.protocol, "Client connected");

    let mut session = match ctx.protocol {
        WireProtocol::Astm => Session::Astm {
            codec: AstmCodec::new(),
            decoder: AstmDecoder::new(),
        },
        WireProtocol::Hl7 => Session::Hl7 {
            codec: MllpCodec::new(),
        },
    };

    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!(%peer, "Connection cancelled");
                    return CloseReason::Cancelled;
                }
            }

            read = timeout(ctx.idle_timeout, stream.read(&mut buf)) => {
                let n = match read {
                    Err(_) => {
                        info!(%peer, "Closing idle connection");
                        return CloseReason::IdleTimeout;
                    }
                    Ok(Err(e)) => return CloseReason::PeerReset(e.to_string()),
                    Ok(Ok(0)) => return CloseReason::PeerClosed,
                    Ok(Ok(n)) => n,
                };

                let outcome = match &mut session {
                    Session::Astm { codec, decoder } => {
                        handle_astm(&mut stream, &ctx, codec, decoder, &buf[..n]).await
                    }
                    Session::Hl7 { codec } => {
                        handle_hl7(&mut stream, &ctx, codec, &buf[..n]).await
                    }
                };

                match outcome {
                    Ok(()) => {}
                    Err(reason) => return reason,
                }
            }
        }
    }
}

// =============================================================================
// ASTM Path
// =============================================================================

async fn handle_astm(
    stream: &mut TcpStream,
    ctx: &ConnectionContext,
    codec: &mut AstmCodec,
    decoder: &mut AstmDecoder,
    data: &[u8],
) -> Result<(), CloseReason> {
    for event in codec.push(data) {
        match event {
            AstmEvent::Reply(bytes) => {
                write_all(stream, &bytes).await?;
            }

            AstmEvent::FrameRejected { reason } => {
                ctx.events.warn("framing", reason);
                write_all(stream, &[astm::NAK]).await?;
            }

            AstmEvent::FramePart => {
                write_all(stream, &[astm::ACK]).await?;
            }

            AstmEvent::FrameComplete(payload) => {
                // Decode the records; persistence decides the reply.
                let messages = decoder.push_payload(&payload);
                let reply = ingest_messages(ctx, messages).await?;
                write_all(stream, &[reply]).await?;
            }

            AstmEvent::SessionEnd => {
                // EOT takes no reply, but a terminator-less message is
                // still flushed and stored.
                if let Some(message) = decoder.flush() {
                    ingest_messages(ctx, vec![message]).await?;
                }
            }

            AstmEvent::Fatal(reason) => {
                ctx.events
                    .error("protocol", format!("{} from {}", reason, ctx.port));
                return Err(CloseReason::NakStorm);
            }
        }
    }

    Ok(())
}

/// Maps and persists decoded messages. Returns the control byte to send:
/// ACK when everything committed, NAK when a message was rejected.
async fn ingest_messages(
    ctx: &ConnectionContext,
    messages: Vec<crate::record::WireMessage>,
) -> Result<u8, CloseReason> {
    let mut reply = astm::ACK;

    for message in messages {
        match mapper::map_message(&message, ctx.analyzer, &ctx.field_map) {
            Ok((canonical, warnings)) => {
                surface_warnings(ctx, &warnings);
                persist(ctx, &canonical).await?;
            }
            Err(IngestError::InvalidRecord(detail)) => {
                warn!(%detail, "Rejecting message");
                ctx.events.warn("invalid_record", detail);
                reply = astm::NAK;
            }
            Err(other) => {
                warn!(error = %other, "Dropping undecodable message");
                ctx.events.warn("decode", other.to_string());
                reply = astm::NAK;
            }
        }
    }

    Ok(reply)
}

// =============================================================================
// HL7 Path
// =============================================================================

async fn handle_hl7(
    stream: &mut TcpStream,
    ctx: &ConnectionContext,
    codec: &mut MllpCodec,
    data: &[u8],
) -> Result<(), CloseReason> {
    for event in codec.push(data) {
        match event {
            MllpEvent::Junk(n) => {
                ctx.events
                    .warn("framing", format!("{} bytes outside MLLP envelope", n));
            }

            MllpEvent::Message(raw) => {
                let ack = match Hl7Decoder::decode(&raw) {
                    Err(e) => {
                        warn!(error = %e, "HL7 decode failed");
                        ctx.events.warn("decode", e.to_string());
                        let control_id =
                            Hl7Decoder::peek_control_id(&raw).unwrap_or_else(|| "0".into());
                        crate::mllp::build_ack(&ctx.app_name, &control_id, AckCode::Error)
                    }

                    Ok(message) => {
                        let control_id =
                            message.control_id.clone().unwrap_or_else(|| "0".into());

                        match mapper::map_message(&message, ctx.analyzer, &ctx.field_map) {
                            Err(e) => {
                                warn!(error = %e, "Rejecting HL7 message");
                                ctx.events.warn("invalid_record", e.to_string());
                                crate::mllp::build_ack(&ctx.app_name, &control_id, AckCode::Reject)
                            }
                            Ok((canonical, warnings)) => {
                                surface_warnings(ctx, &warnings);
                                persist(ctx, &canonical).await?;
                                crate::mllp::build_ack(&ctx.app_name, &control_id, AckCode::Accept)
                            }
                        }
                    }
                };

                write_all(stream, &ack).await?;
            }
        }
    }

    Ok(())
}

// =============================================================================
// Persistence
// =============================================================================

/// Commits a canonical message with a short retry, then publishes the
/// ingest event. Gives up with a close (and therefore no acknowledgement)
/// when the store stays down.
async fn persist(ctx: &ConnectionContext, message: &CanonicalMessage) -> Result<(), CloseReason> {
    let mut last_error: Option<DbError> = None;

    for attempt in 1..=PERSIST_ATTEMPTS {
        match ctx.db.store_message(message).await {
            Ok(stored) => {
                ctx.events.publish(AppEvent::MessageIngested {
                    port: ctx.port,
                    summary: MessageSummary {
                        analyzer: message.analyzer,
                        patient_id: if message.patient.external_id.is_empty() {
                            message.patient.internal_id.clone()
                        } else {
                            message.patient.external_id.clone()
                        },
                        sample_id: message.first_sample_id().to_string(),
                        result_count: stored.result_ids.len(),
                    },
                });
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, error = %e, "Store write failed");
                let transient = e.is_transient();
                last_error = Some(e);
                if !transient {
                    break;
                }
                tokio::time::sleep(PERSIST_BACKOFF).await;
            }
        }
    }

    let detail = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".into());
    ctx.events.error("persistence", detail);
    Err(CloseReason::PersistenceFailure)
}

fn surface_warnings(ctx: &ConnectionContext, warnings: &[crate::error::MappingWarning]) {
    for warning in warnings {
        ctx.events.warn("mapping", warning.detail.clone());
    }
}

async fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), CloseReason> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| CloseReason::PeerReset(e.to_string()))
}
