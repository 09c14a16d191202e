use std::io::ErrorKind;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::codec::{FrameDecoder, ResponseHeadDecoder};
use crate::connection::{Client, ClientState, HandlerSettings};
use crate::pipe::{spill_pipe, BufferedInput, SpillDrain, SpillWriter};
use crate::pool::{CheckoutError, Conduit, PoolOptions, Session, SessionPool};
use crate::protocol::{rewrite_response_head, ClientError, HeaderSet};
use crate::response::error_response_head;

/// Key under which the session's one-time password is appended to the
/// header block forwarded to the worker.
const CONNECT_PASSWORD_KEY: &[u8] = b"PASSENGER_CONNECT_PASSWORD";

/// Maximum number of session checkouts attempted for one request.
const MAX_SESSION_CHECKOUT_TRIES: u32 = 10;

/// Drives one accepted client connection through the whole request
/// lifecycle and tears everything down when it returns.
///
/// `Ok(())` covers both normal completion and quiet closes (the peer going
/// away); an `Err` carries the reason the accept loop should log.
pub struct ClientConnection {
    client: Client,
    settings: Arc<HandlerSettings>,
    pool: Arc<dyn SessionPool>,
}

enum CheckoutFailure {
    Spawn(CheckoutError),
    Fatal(ClientError),
}

/// The body source active during forwarding: exactly one of the client
/// socket or the request-body buffer.
enum BodySource<R> {
    Direct(BufferedInput<R>),
    Buffered(SpillDrain),
}

impl<R> BodySource<R>
where
    R: AsyncRead + Unpin,
{
    async fn next_chunk(&mut self) -> std::io::Result<Bytes> {
        match self {
            Self::Direct(input) => input.next_chunk().await,
            Self::Buffered(drain) => Ok(drain.next_chunk().await?.unwrap_or_default()),
        }
    }
}

struct PendingWrite {
    chunk: Bytes,
    offset: usize,
}

impl PendingWrite {
    fn new(chunk: Bytes) -> Self {
        Self { chunk, offset: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.chunk[self.offset..]
    }
}

enum BodyProgress {
    Step,
    Eof,
    AppClosedInput,
}

enum OutputProgress {
    Step,
    Finished,
    ClientGone,
}

impl ClientConnection {
    pub fn new(id: u64, settings: Arc<HandlerSettings>, pool: Arc<dyn SessionPool>) -> Self {
        Self { client: Client::new(id), settings, pool }
    }

    /// Runs the connection to completion and marks the client disconnected.
    pub async fn process<S>(mut self, stream: S) -> Result<(), ClientError>
    where
        S: Conduit,
    {
        let result = self.run(stream).await;
        self.set_state(ClientState::Disconnected);
        result
    }

    async fn run<S>(&mut self, stream: S) -> Result<(), ClientError>
    where
        S: Conduit,
    {
        let (read_half, mut client_wr) = split(stream);
        let mut client_in = BufferedInput::new(read_half);

        // The one timer this connection arms; it is not re-armed after the
        // password has been read.
        let deadline = self.settings.connect_password_timeout;
        let authenticated =
            match timeout(deadline, self.read_connect_password(&mut client_in)).await {
                Ok(result) => result?,
                Err(_) => return Err(ClientError::ConnectPasswordTimeout),
            };
        if !authenticated {
            return Ok(());
        }
        self.set_state(ClientState::ReadingHeader);

        let mut headers = match self.read_request_frame(&mut client_in).await? {
            Some(headers) => headers,
            None => return Ok(()),
        };
        let changed = headers.normalize_entity_headers();
        headers.rebuild_data(changed);

        // From here on the output pipe is the only write path to the client.
        let (out_writer, out_drain) =
            spill_pipe(self.settings.memory_threshold, &self.settings.spool_dir);

        let body_buffer = if headers.bool_option("PASSENGER_BUFFERING", false) {
            self.client.request_body_is_buffered = true;
            self.set_state(ClientState::BufferingRequestBody);
            Some(self.buffer_request_body(&mut client_in).await?)
        } else {
            None
        };

        self.set_state(ClientState::CheckingOutSession);
        let options = PoolOptions::from_headers(&headers);
        let (session, app_stream) = match self.checkout_session(&options).await {
            Ok(checked_out) => checked_out,
            Err(CheckoutFailure::Spawn(error)) => {
                return self
                    .write_error_response(
                        &headers,
                        &options,
                        &error,
                        out_writer,
                        out_drain,
                        &mut client_wr,
                    )
                    .await;
            }
            Err(CheckoutFailure::Fatal(error)) => return Err(error),
        };

        self.set_state(ClientState::SendingHeaderToApp);
        let (app_rd, mut app_wr) = split(app_stream);
        let app_in = BufferedInput::new(app_rd);
        self.send_header_to_app(&mut app_wr, &headers, session.connect_password()).await?;

        self.set_state(ClientState::ForwardingBodyToApp);
        self.forward(&headers, client_in, body_buffer, app_in, app_wr, out_writer, out_drain, client_wr)
            .await
    }

    fn set_state(&mut self, state: ClientState) {
        trace!(
            client = self.client.id,
            from = self.client.state.name(),
            to = state.name(),
            "state transition"
        );
        self.client.state = state;
    }

    /// Reads and checks the connect password. `Ok(false)` means the peer
    /// went away before completing it (a quiet close).
    async fn read_connect_password<R>(
        &mut self,
        client_in: &mut BufferedInput<R>,
    ) -> Result<bool, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let password = self.settings.connect_password.clone().into_bytes();
        if password.is_empty() {
            return Ok(true);
        }

        let mut buffered: Option<Vec<u8>> = None;
        loop {
            let chunk = client_in.next_chunk().await.map_err(ClientError::client_read)?;
            if chunk.is_empty() {
                debug!(client = self.client.id, "client sent EOF before the connect password");
                return Ok(false);
            }

            match buffered.as_mut() {
                None if chunk.len() >= password.len() => {
                    if chunk[..password.len()] == password[..] {
                        client_in.unconsume(chunk.slice(password.len()..));
                        return Ok(true);
                    }
                    return Err(ClientError::WrongConnectPassword);
                }
                None => {
                    self.set_state(ClientState::StillReadingConnectPassword);
                    let mut partial = Vec::with_capacity(password.len());
                    partial.extend_from_slice(&chunk);
                    buffered = Some(partial);
                }
                Some(partial) => {
                    let wanted = password.len() - partial.len();
                    let take = wanted.min(chunk.len());
                    partial.extend_from_slice(&chunk[..take]);
                    if partial.len() == password.len() {
                        if partial[..] == password[..] {
                            client_in.unconsume(chunk.slice(take..));
                            return Ok(true);
                        }
                        return Err(ClientError::WrongConnectPassword);
                    }
                }
            }
        }
    }

    /// Reads the framed header block. `Ok(None)` means the peer closed
    /// before completing it.
    async fn read_request_frame<R>(
        &mut self,
        client_in: &mut BufferedInput<R>,
    ) -> Result<Option<HeaderSet>, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut acc = BytesMut::new();
        loop {
            let chunk = client_in.next_chunk().await.map_err(ClientError::client_read)?;
            if chunk.is_empty() {
                debug!(
                    client = self.client.id,
                    "client sent EOF before a complete request header"
                );
                return Ok(None);
            }
            acc.extend_from_slice(&chunk);
            if let Some(headers) = decoder.decode(&mut acc)? {
                // Whatever follows the block is the start of the body.
                client_in.unconsume(acc.split().freeze());
                trace!(client = self.client.id, headers = headers.len(), "request header parsed");
                return Ok(Some(headers));
            }
        }
    }

    /// Spools the whole request body into a spill pipe and returns the
    /// drain the forwarding phase will read from.
    async fn buffer_request_body<R>(
        &mut self,
        client_in: &mut BufferedInput<R>,
    ) -> Result<SpillDrain, ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let (writer, drain) = spill_pipe(self.settings.memory_threshold, &self.settings.spool_dir);
        loop {
            let chunk = client_in.next_chunk().await.map_err(ClientError::client_read)?;
            if chunk.is_empty() {
                writer.end().await;
                trace!(client = self.client.id, "request body fully buffered");
                return Ok(drain);
            }
            // A false return means the chunk went to disk; the await has
            // already covered the commit, so reading simply resumes.
            if !writer.write(chunk).await.map_err(ClientError::body_buffer)? {
                trace!(client = self.client.id, "request body buffer spilled to disk");
            }
        }
    }

    /// Checks out and initiates a session, retrying transient initiation
    /// failures with a fresh checkout.
    async fn checkout_session(
        &mut self,
        options: &PoolOptions,
    ) -> Result<(Box<dyn Session>, Box<dyn Conduit>), CheckoutFailure> {
        loop {
            let mut session = match self.pool.checkout(options).await {
                Ok(session) => session,
                Err(error) => {
                    warn!(client = self.client.id, cause = %error, "cannot check out a session");
                    return Err(CheckoutFailure::Spawn(error));
                }
            };
            self.client.checkout_tries += 1;

            match session.initiate().await {
                Ok(conduit) => {
                    trace!(
                        client = self.client.id,
                        tries = self.client.checkout_tries,
                        "session initiated"
                    );
                    return Ok((session, conduit));
                }
                Err(cause) if self.client.checkout_tries < MAX_SESSION_CHECKOUT_TRIES => {
                    trace!(
                        client = self.client.id,
                        cause = %cause,
                        attempt = self.client.checkout_tries,
                        "session initiation failed, retrying with a fresh session"
                    );
                }
                Err(cause) => {
                    warn!(
                        client = self.client.id,
                        cause = %cause,
                        "session initiation failed on the final attempt"
                    );
                    return Err(CheckoutFailure::Fatal(ClientError::InitiateSession));
                }
            }
        }
    }

    /// Serves the 500 error page through the output pipe. Only legal while
    /// no response bytes can have reached the client yet.
    async fn write_error_response<W>(
        &mut self,
        headers: &HeaderSet,
        options: &PoolOptions,
        error: &CheckoutError,
        out_writer: SpillWriter,
        mut out_drain: SpillDrain,
        client_wr: &mut W,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(self.client.state < ClientState::ForwardingBodyToApp);
        self.set_state(ClientState::WritingSimpleResponse);

        let friendly = headers.bool_option("PASSENGER_FRIENDLY_ERROR_PAGES", true);
        let (message, spawn_error) = match &error.error_page {
            Some(page) => (page.as_str(), Some(error)),
            None => (error.message.as_str(), None),
        };
        let body = self.settings.templates.render(friendly, message, spawn_error, options);
        let head = error_response_head(
            headers.bool_option("PASSENGER_PRINT_STATUS_LINE", true),
            body.len(),
        );

        out_writer.write(head).await.map_err(ClientError::output_pipe)?;
        out_writer.write(Bytes::from(body.into_bytes())).await.map_err(ClientError::output_pipe)?;
        out_writer.end().await;

        while let Some(chunk) = out_drain.next_chunk().await.map_err(ClientError::output_pipe)? {
            if let Err(e) = client_wr.write_all(&chunk).await {
                if e.kind() == ErrorKind::BrokenPipe {
                    debug!(
                        client = self.client.id,
                        "client went away while receiving the error page"
                    );
                    return Ok(());
                }
                return Err(ClientError::client_write(e));
            }
        }
        Ok(())
    }

    /// Writes the length-prefixed header message: a 4-byte big-endian
    /// length covering the header block plus the appended one-time connect
    /// password pair.
    async fn send_header_to_app(
        &mut self,
        app_wr: &mut WriteHalf<Box<dyn Conduit>>,
        headers: &HeaderSet,
        connect_password: &str,
    ) -> Result<(), ClientError> {
        let header_data = headers.header_data();
        let payload_len =
            header_data.len() + CONNECT_PASSWORD_KEY.len() + 1 + connect_password.len() + 1;

        let mut message = BytesMut::with_capacity(4 + payload_len);
        message.put_u32(payload_len as u32);
        message.put_slice(header_data);
        message.put_slice(CONNECT_PASSWORD_KEY);
        message.put_u8(0);
        message.put_slice(connect_password.as_bytes());
        message.put_u8(0);

        trace!(client = self.client.id, bytes = message.len(), "sending header to application");
        app_wr.write_all(&message).await.map_err(ClientError::app_write)?;
        Ok(())
    }

    /// The forwarding phase: request body towards the worker, response
    /// towards the client, with the output spill pipe decoupling the two
    /// peers' speeds. Finishes when the response has fully drained.
    #[allow(clippy::too_many_arguments)]
    async fn forward<S>(
        &mut self,
        headers: &HeaderSet,
        client_in: BufferedInput<tokio::io::ReadHalf<S>>,
        body_buffer: Option<SpillDrain>,
        mut app_in: BufferedInput<tokio::io::ReadHalf<Box<dyn Conduit>>>,
        mut app_wr: WriteHalf<Box<dyn Conduit>>,
        out_writer: SpillWriter,
        mut out_drain: SpillDrain,
        mut client_wr: WriteHalf<S>,
    ) -> Result<(), ClientError>
    where
        S: Conduit,
    {
        let print_status_line = headers.bool_option("PASSENGER_PRINT_STATUS_LINE", true);
        let buffered = self.client.request_body_is_buffered;

        let mut source = match body_buffer {
            Some(drain) => BodySource::Buffered(drain),
            None => BodySource::Direct(client_in),
        };
        let mut head_decoder = ResponseHeadDecoder::new();
        let mut head_acc = BytesMut::new();
        let mut pending_body: Option<PendingWrite> = None;
        let mut pending_out: Option<PendingWrite> = None;
        let mut body_open = true;
        let mut response_open = true;

        loop {
            tokio::select! {
                biased;

                step = output_step(&mut out_drain, &mut client_wr, &mut pending_out) => {
                    match step? {
                        OutputProgress::Step => {}
                        OutputProgress::Finished => {
                            trace!(client = self.client.id, "response fully delivered");
                            return Ok(());
                        }
                        OutputProgress::ClientGone => {
                            debug!(
                                client = self.client.id,
                                "client went away; dropping the rest of the response"
                            );
                            return Ok(());
                        }
                    }
                }

                chunk = app_in.next_chunk(), if response_open => {
                    let chunk = chunk.map_err(ClientError::app_read)?;
                    if chunk.is_empty() {
                        trace!(client = self.client.id, "application sent EOF");
                        out_writer.end().await;
                        response_open = false;
                    } else {
                        self.handle_app_data(
                            chunk,
                            &mut head_decoder,
                            &mut head_acc,
                            &out_writer,
                            print_status_line,
                        )
                        .await?;
                    }
                }

                step = body_step(&mut source, &mut app_wr, &mut pending_body, buffered), if body_open => {
                    match step? {
                        BodyProgress::Step => {}
                        BodyProgress::Eof => {
                            trace!(
                                client = self.client.id,
                                "end of request body; shutting down the app write half"
                            );
                            let _ = app_wr.shutdown().await;
                            body_open = false;
                        }
                        BodyProgress::AppClosedInput => {
                            debug!(
                                client = self.client.id,
                                "application closed its input early; continuing with the response"
                            );
                            pending_body = None;
                            body_open = false;
                        }
                    }
                }
            }
        }
    }

    /// Response bytes from the worker: buffer until the header block is
    /// complete, rewrite it, then stream everything through the output pipe.
    async fn handle_app_data(
        &mut self,
        chunk: Bytes,
        head_decoder: &mut ResponseHeadDecoder,
        head_acc: &mut BytesMut,
        out_writer: &SpillWriter,
        print_status_line: bool,
    ) -> Result<(), ClientError> {
        if self.client.response_header_seen {
            return self.write_to_client_output(out_writer, chunk).await;
        }

        head_acc.extend_from_slice(&chunk);
        let head = match head_decoder.decode(head_acc)? {
            Some(head) => head,
            None => return Ok(()),
        };
        self.client.response_header_seen = true;

        let tail = head_acc.split().freeze();
        let rewritten =
            rewrite_response_head(&head, print_status_line, &self.settings.identity)?;

        self.write_to_client_output(out_writer, rewritten.prefix).await?;
        match rewritten.header {
            // The header lay wholly inside this chunk and is unmodified:
            // forward the chunk as-is.
            None if head.len() + tail.len() == chunk.len() => {
                self.write_to_client_output(out_writer, chunk).await?;
            }
            None => {
                self.write_to_client_output(out_writer, head).await?;
                self.write_to_client_output(out_writer, tail).await?;
            }
            Some(new_head) => {
                self.write_to_client_output(out_writer, new_head).await?;
                self.write_to_client_output(out_writer, tail).await?;
            }
        }
        Ok(())
    }

    async fn write_to_client_output(
        &self,
        out_writer: &SpillWriter,
        chunk: Bytes,
    ) -> Result<(), ClientError> {
        if !out_writer.write(chunk).await.map_err(ClientError::output_pipe)? {
            trace!(client = self.client.id, "client output pipe spilled to disk");
        }
        Ok(())
    }
}

/// One step of request-body forwarding: either fetch the next source chunk
/// or push more of the current one into the worker socket. Single-write
/// steps keep the surrounding select loop responsive while the worker is
/// slow to accept data.
async fn body_step<R>(
    source: &mut BodySource<R>,
    app_wr: &mut WriteHalf<Box<dyn Conduit>>,
    pending: &mut Option<PendingWrite>,
    buffered: bool,
) -> Result<BodyProgress, ClientError>
where
    R: AsyncRead + Unpin,
{
    match pending {
        Some(write) => match app_wr.write(write.remaining()).await {
            Ok(0) => Ok(BodyProgress::AppClosedInput),
            Ok(n) => {
                write.offset += n;
                if write.offset >= write.chunk.len() {
                    *pending = None;
                }
                Ok(BodyProgress::Step)
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(BodyProgress::AppClosedInput),
            Err(e) => Err(ClientError::app_write(e)),
        },
        None => {
            let chunk = source.next_chunk().await.map_err(|e| {
                if buffered {
                    ClientError::body_buffer(e)
                } else {
                    ClientError::client_read(e)
                }
            })?;
            if chunk.is_empty() {
                return Ok(BodyProgress::Eof);
            }
            *pending = Some(PendingWrite::new(chunk));
            Ok(BodyProgress::Step)
        }
    }
}

/// One step of response delivery: fetch the next output-pipe chunk or push
/// more of the current one into the client socket.
async fn output_step<W>(
    drain: &mut SpillDrain,
    client_wr: &mut W,
    pending: &mut Option<PendingWrite>,
) -> Result<OutputProgress, ClientError>
where
    W: AsyncWrite + Unpin,
{
    match pending {
        Some(write) => match client_wr.write(write.remaining()).await {
            Ok(0) => Ok(OutputProgress::ClientGone),
            Ok(n) => {
                write.offset += n;
                if write.offset >= write.chunk.len() {
                    *pending = None;
                }
                Ok(OutputProgress::Step)
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(OutputProgress::ClientGone),
            Err(e) => Err(ClientError::client_write(e)),
        },
        None => match drain.next_chunk().await.map_err(ClientError::output_pipe)? {
            Some(chunk) => {
                *pending = Some(PendingWrite::new(chunk));
                Ok(OutputProgress::Step)
            }
            None => Ok(OutputProgress::Finished),
        },
    }
}
