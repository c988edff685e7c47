//! PostgreSQL v3 protocol handler.
//!
//! Handles the startup exchange (SSL negotiation, startup parameters,
//! cancel requests) and the query phase. Simple queries are deferred to
//! the execution pool; everything the handler produces goes through the
//! response queue as payload-only packets, with framing left to the
//! connection's serializer.

use tracing::{debug, info, warn};

use crate::buffer::ByteBuffer;
use crate::protocol::backend::{
    BackendMessage, FieldDescription, TransactionStatus, encryption_answer, get_cstring, sql_state,
};
use crate::protocol::handler::{ProcessResult, ProtocolHandler, StartupOutcome};
use crate::protocol::packet::{InboundPacket, OutboundPacket, PacketStatus};
use crate::protocol::startup::StartupRequest;
use crate::query::{QueryOutcome, QueryRouter};
use crate::tasks::WakeHandle;

/// Parameter status values psql and friends expect at session start.
const STARTUP_PARAMETERS: [(&str, &str); 7] = [
    ("server_version", "16.0"),
    ("server_encoding", "UTF8"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("TimeZone", "UTC"),
    ("integer_datetimes", "on"),
    ("standard_conforming_strings", "on"),
];

pub struct PostgresHandler {
    router: QueryRouter,
    responses: Vec<OutboundPacket>,
    flush_requested: bool,
    /// In-progress regular packet; survives across short reads.
    pending: InboundPacket,
    process_id: i32,
    secret_key: i32,
}

impl PostgresHandler {
    pub fn new(router: QueryRouter, connection_id: u64) -> Self {
        Self {
            router,
            responses: Vec::new(),
            flush_requested: false,
            pending: InboundPacket::new(),
            process_id: connection_id as i32,
            secret_key: rand::random::<i32>(),
        }
    }

    fn push(&mut self, message: BackendMessage) {
        self.responses.push(message.into_packet());
    }

    /// ReadyForQuery ends every exchange and always wants the bytes on
    /// the wire.
    fn push_ready_for_query(&mut self) {
        self.push(BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        self.flush_requested = true;
    }

    fn dispatch(&mut self, msg_type: u8, payload: &[u8], worker_id: u64) -> ProcessResult {
        match msg_type {
            b'Q' => {
                let Some((sql, _)) = get_cstring(payload) else {
                    self.push(BackendMessage::error(
                        sql_state::PROTOCOL_VIOLATION,
                        "query string is not valid UTF-8",
                    ));
                    self.push_ready_for_query();
                    return ProcessResult::Complete;
                };
                debug!(worker_id, query = sql, "query deferred to execution pool");
                self.router.submit(sql.to_string());
                ProcessResult::Processing
            }
            b'X' => {
                debug!("client terminated the session");
                ProcessResult::Terminate
            }
            // Sync: nothing buffered to synchronize, acknowledge readiness.
            b'S' => {
                self.push_ready_for_query();
                ProcessResult::Complete
            }
            // Flush: push whatever is queued.
            b'H' => {
                self.flush_requested = true;
                ProcessResult::Complete
            }
            other => {
                warn!(msg_type = %(other as char), "unsupported frontend message");
                self.push(BackendMessage::error(
                    sql_state::FEATURE_NOT_SUPPORTED,
                    format!("message type '{}' is not supported", other as char),
                ));
                self.push_ready_for_query();
                ProcessResult::Complete
            }
        }
    }
}

impl ProtocolHandler for PostgresHandler {
    fn process_startup(
        &mut self,
        packet: &mut InboundPacket,
        ssl_supported: bool,
    ) -> StartupOutcome {
        let payload = packet.take_payload();
        match StartupRequest::parse(&payload) {
            Ok(StartupRequest::Ssl) => {
                debug!(supported = ssl_supported, "ssl requested");
                self.responses.push(encryption_answer(ssl_supported));
                self.flush_requested = true;
                StartupOutcome::Proceed {
                    identity: None,
                    begin_tls: ssl_supported,
                    startup_complete: false,
                }
            }
            Ok(StartupRequest::GssEnc) => {
                debug!("gssapi encryption requested, declining");
                self.responses.push(encryption_answer(false));
                self.flush_requested = true;
                StartupOutcome::Proceed {
                    identity: None,
                    begin_tls: false,
                    startup_complete: false,
                }
            }
            Ok(StartupRequest::Cancel { process_id, .. }) => {
                // Cancel requests ride a throwaway connection; the
                // request itself is the whole conversation.
                debug!(target_pid = process_id, "cancel request received");
                StartupOutcome::Terminate
            }
            Ok(StartupRequest::Startup {
                protocol_version,
                identity,
            }) => {
                info!(
                    user = %identity.user,
                    database = identity.database.as_deref().unwrap_or(""),
                    version = protocol_version,
                    "startup accepted"
                );

                self.push(BackendMessage::AuthenticationOk);
                for (name, value) in STARTUP_PARAMETERS {
                    self.push(BackendMessage::ParameterStatus {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                }
                self.push(BackendMessage::BackendKeyData {
                    process_id: self.process_id,
                    secret_key: self.secret_key,
                });
                self.push_ready_for_query();

                StartupOutcome::Proceed {
                    identity: Some(identity),
                    begin_tls: false,
                    startup_complete: true,
                }
            }
            Err(e) => {
                warn!(error = %e, "malformed startup packet");
                StartupOutcome::Terminate
            }
        }
    }

    fn process(&mut self, buf: &mut ByteBuffer, worker_id: u64) -> ProcessResult {
        match self.pending.advance(buf, false) {
            Err(e) => {
                warn!(error = %e, "malformed packet");
                return ProcessResult::Terminate;
            }
            Ok(PacketStatus::MoreDataNeeded) => return ProcessResult::MoreDataNeeded,
            Ok(PacketStatus::Ready) => {}
        }

        let msg_type = self.pending.msg_type();
        let payload = self.pending.take_payload();
        self.pending.reset();
        self.dispatch(msg_type, &payload, worker_id)
    }

    fn get_result(&mut self) {
        match self.router.take_outcome() {
            Some(QueryOutcome::Empty) => {
                self.push(BackendMessage::EmptyQueryResponse);
            }
            Some(QueryOutcome::Command { tag }) => {
                self.push(BackendMessage::CommandComplete { tag });
            }
            Some(QueryOutcome::Rows { columns, rows }) => {
                let row_count = rows.len();
                self.push(BackendMessage::RowDescription {
                    fields: columns.into_iter().map(FieldDescription::text).collect(),
                });
                for values in rows {
                    self.push(BackendMessage::DataRow { values });
                }
                self.push(BackendMessage::CommandComplete {
                    tag: format!("SELECT {row_count}"),
                });
            }
            Some(QueryOutcome::Error { code, message }) => {
                self.push(BackendMessage::error(code, message));
            }
            None => {
                warn!("woken without a completed query result");
                self.push(BackendMessage::error(
                    sql_state::INTERNAL_ERROR,
                    "query result went missing",
                ));
            }
        }
        self.push_ready_for_query();
    }

    fn set_wake_handle(&mut self, wake: WakeHandle) {
        self.router.set_wake_handle(wake);
    }

    fn responses(&mut self) -> &mut Vec<OutboundPacket> {
        &mut self.responses
    }

    fn flush_requested(&self) -> bool {
        self.flush_requested
    }

    fn set_flush_requested(&mut self, on: bool) {
        self.flush_requested = on;
    }

    fn reset(&mut self) {
        self.responses.clear();
        self.flush_requested = false;
        self.pending.reset();
        self.router.reset();
    }
}
