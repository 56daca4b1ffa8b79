//! A channel to a single broker: frames requests onto the socket, correlates
//! responses back to their callers, and fails everything pending the moment
//! the stream becomes suspect.

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    sync::{
        oneshot::{channel, Sender},
        Mutex as AsyncMutex,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::protocol::{
    api_version::ApiVersion,
    frame::{AsyncMessageRead, AsyncMessageWrite},
    messages::{
        ReadVersionedError, ReadVersionedType, RequestBody, RequestHeader, ResponseHeader,
        WriteVersionedError, WriteVersionedType,
    },
    primitives::{Int16, Int32, String_},
};

struct Response {
    #[allow(dead_code)]
    header: ResponseHeader,
    data: Cursor<Vec<u8>>,
}

enum MessengerState {
    /// Requests in flight, keyed by correlation ID.
    RequestMap(HashMap<i32, ActiveRequest>),

    /// One stream half is dead; nothing can be sent any more.
    Poisoned(Arc<String>),
}

struct ActiveRequest {
    channel: Sender<Response>,
}

impl MessengerState {
    /// Fail every pending request and reject all future sends.
    fn poison(&mut self, reason: String) -> Arc<String> {
        match self {
            Self::RequestMap(map) => {
                let reason = Arc::new(reason);
                // dropping the senders wakes every waiting caller
                map.clear();
                *self = Self::Poisoned(Arc::clone(&reason));
                reason
            }
            Self::Poisoned(reason) => Arc::clone(reason),
        }
    }
}

/// A bidirectional channel to one broker.
///
/// Writes are serialized by a mutex on the write half; a background task owns
/// the read half and routes each response frame to the caller that sent the
/// matching correlation ID. The wire guarantees per-connection FIFO, so a
/// response that cannot be matched means framing is broken and the whole
/// channel is poisoned.
pub struct Messenger<RW> {
    stream_write: AsyncMutex<WriteHalf<RW>>,
    client_id: String_,
    correlation_id: AtomicI32,
    state: Arc<Mutex<MessengerState>>,
    join_handle: JoinHandle<()>,
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Connection is poisoned: {0}")]
    Poisoned(Arc<String>),

    #[error("Cannot read/write data: {0}")]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    WriteError(#[from] WriteVersionedError),

    #[error(transparent)]
    WriteMessageError(#[from] crate::protocol::frame::WriteError),

    #[error(transparent)]
    ReadError(#[from] ReadVersionedError),
}

impl RequestError {
    /// `true` when the channel died rather than the request being invalid;
    /// the caller should replace the connection and may retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Poisoned(_) | Self::IO(_))
    }
}

impl<RW> Messenger<RW>
where
    RW: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: RW, max_message_size: usize, client_id: String_) -> Self {
        let (stream_read, stream_write) = tokio::io::split(stream);
        let state = Arc::new(Mutex::new(MessengerState::RequestMap(HashMap::new())));
        let state_captured = Arc::clone(&state);

        let join_handle = tokio::spawn(async move {
            let mut stream_read = stream_read;

            loop {
                let msg = match stream_read.read_message(max_message_size).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        state_captured.lock().poison(format!("read error: {e}"));
                        break;
                    }
                };

                let mut cursor = Cursor::new(msg);
                let header = match ResponseHeader::read_versioned(
                    &mut cursor,
                    ApiVersion(Int16(0)),
                ) {
                    Ok(header) => header,
                    Err(e) => {
                        state_captured
                            .lock()
                            .poison(format!("cannot read response header: {e}"));
                        break;
                    }
                };

                let correlation_id = header.correlation_id.0;
                let removed = {
                    let mut state = state_captured.lock();
                    match &mut *state {
                        MessengerState::RequestMap(map) => map.remove(&correlation_id),
                        MessengerState::Poisoned(_) => break,
                    }
                };
                let Some(active_request) = removed else {
                    // framing is suspect: FIFO pairing means we should know
                    // every ID we ever see
                    state_captured.lock().poison(format!(
                        "got response for unknown correlation ID {correlation_id}"
                    ));
                    break;
                };

                // the caller may have given up on the deadline; the response
                // is still drained either way
                active_request
                    .channel
                    .send(Response {
                        header,
                        data: cursor,
                    })
                    .ok();
            }

            debug!("read loop terminated");
        });

        Self {
            stream_write: AsyncMutex::new(stream_write),
            client_id,
            correlation_id: AtomicI32::new(0),
            state,
            join_handle,
        }
    }

    /// Send a request and await its response.
    ///
    /// The body is written at the newest version this client supports for the
    /// API. Concurrent callers are ordered by their arrival at the write
    /// lock.
    pub async fn request<R>(&self, msg: R) -> Result<R::ResponseBody, RequestError>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
        R::ResponseBody: ReadVersionedType<Cursor<Vec<u8>>>,
    {
        let body_api_version = R::API_VERSION_RANGE.max();
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);

        let header = RequestHeader {
            request_api_key: R::API_KEY,
            request_api_version: body_api_version,
            correlation_id: Int32(correlation_id),
            client_id: self.client_id.clone(),
        };

        let mut buf = Vec::new();
        header
            .write_versioned(&mut buf, ApiVersion(Int16(0)))
            .expect("request header is always writable to an in-mem buffer");
        msg.write_versioned(&mut buf, body_api_version)?;

        let (tx, rx) = channel();
        {
            let mut state = self.state.lock();
            match &mut *state {
                MessengerState::RequestMap(map) => {
                    map.insert(correlation_id, ActiveRequest { channel: tx });
                }
                MessengerState::Poisoned(reason) => {
                    return Err(RequestError::Poisoned(Arc::clone(reason)));
                }
            }
        }

        {
            let mut stream_write = self.stream_write.lock().await;
            let write = async {
                stream_write.write_message(&buf).await?;
                stream_write.flush().await?;
                Ok::<(), RequestError>(())
            };
            if let Err(e) = write.await {
                let reason = self.state.lock().poison(format!("write error: {e}"));
                return Err(RequestError::Poisoned(reason));
            }
        }

        let mut response = match rx.await {
            Ok(response) => response,
            Err(_) => {
                // sender dropped by poisoning
                let reason = match &*self.state.lock() {
                    MessengerState::Poisoned(reason) => Arc::clone(reason),
                    MessengerState::RequestMap(_) => {
                        Arc::new("pending request dropped".to_string())
                    }
                };
                return Err(RequestError::Poisoned(reason));
            }
        };

        match R::ResponseBody::read_versioned(&mut response.data, body_api_version) {
            Ok(body) => Ok(body),
            Err(e) => {
                // a frame we cannot decode means the stream is suspect
                self.state.lock().poison(format!("cannot decode body: {e}"));
                Err(e.into())
            }
        }
    }

    /// Poison the channel, failing all pending and future requests.
    pub fn close(&self, reason: &str) {
        self.state.lock().poison(reason.to_string());
        self.join_handle.abort();
    }

    /// `true` once the channel can no longer carry requests.
    pub fn is_poisoned(&self) -> bool {
        matches!(&*self.state.lock(), MessengerState::Poisoned(_))
    }
}

impl<RW> Drop for Messenger<RW> {
    fn drop(&mut self) {
        if !self.join_handle.is_finished() {
            self.join_handle.abort();
        }
        let pending = match &*self.state.lock() {
            MessengerState::RequestMap(map) => map.len(),
            MessengerState::Poisoned(_) => 0,
        };
        if pending > 0 {
            warn!(pending, "dropping messenger with requests in flight");
        }
    }
}

impl<RW> std::fmt::Debug for Messenger<RW> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
