//! The connection worker: owns the transport, runs the reader and writer
//! threads, and demultiplexes responses to waiting callers by message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::packets::smb2::*;
use crate::Error;

use super::sequence_window::SequenceWindow;
use super::transformer::{IncomingMessage, Transformer};
use super::transport::Transport;

/// Per in-flight request state, [MS-SMB2] 3.2.1.7.
#[derive(Debug)]
pub struct Request {
    /// The message as sent, header updated with id and signature.
    message: PlainMessage,
    cancel_id: [u8; 8],
    async_id: [u8; 8],
    timestamp: Instant,
}

impl Request {
    fn new(message: PlainMessage) -> Self {
        let mut cancel_id = [0u8; 8];
        let mut async_id = [0u8; 8];
        OsRng.fill_bytes(&mut cancel_id);
        OsRng.fill_bytes(&mut async_id);
        Self {
            message,
            cancel_id,
            async_id,
            timestamp: Instant::now(),
        }
    }

    pub fn message(&self) -> &PlainMessage {
        &self.message
    }

    pub fn cancel_id(&self) -> &[u8; 8] {
        &self.cancel_id
    }

    pub fn async_id(&self) -> &[u8; 8] {
        &self.async_id
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// An outstanding request and its response slot. The slot is filled by the
/// reader thread and drained by `receive`; when a receiver is already
/// waiting, the response is handed straight to its channel instead.
#[derive(Debug)]
struct RequestSlot {
    request: Request,
    waiter: Option<mpsc::Sender<crate::Result<IncomingMessage>>>,
    response: Option<crate::Result<IncomingMessage>>,
}

impl RequestSlot {
    fn new(request: Request) -> Self {
        Self {
            request,
            waiter: None,
            response: None,
        }
    }
}

#[derive(Debug, Default)]
struct AwaitState {
    outstanding: HashMap<u64, RequestSlot>,
}

/// One worker per connection. Takes ownership of the [`Transport`] on
/// [`ConnectionWorker::start`] and splits it between a dedicated reader
/// thread and a dedicated writer thread.
#[derive(Debug)]
pub struct ConnectionWorker {
    state: Mutex<AwaitState>,

    /// The connection send mutex: message id allocation, request-table
    /// insertion and frame hand-off happen as one atomic unit under it.
    send_state: Mutex<SendState>,

    transformer: Transformer,

    stopped: AtomicBool,
    /// A fatal error, latched for delivery to every current and future
    /// receiver.
    fatal: RwLock<Option<Arc<Error>>>,

    timeout: RwLock<Duration>,

    /// A clone of the socket, used to unblock the loops on stop.
    shutdown_handle: Transport,
    handles: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

#[derive(Debug)]
struct SendState {
    sequence_window: SequenceWindow,
    sender: mpsc::Sender<Option<Vec<u8>>>,
}

impl ConnectionWorker {
    /// Starts the worker loops over a connected transport. The sequence
    /// window is handed over from the caller, which may have consumed
    /// credits during multi-protocol negotiation already.
    pub fn start(
        transport: Transport,
        sequence_window: SequenceWindow,
        timeout: Duration,
    ) -> crate::Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();

        let reader_transport = transport.try_clone()?;
        let shutdown_handle = transport.try_clone()?;

        let worker = Arc::new(ConnectionWorker {
            state: Mutex::new(AwaitState::default()),
            send_state: Mutex::new(SendState {
                sequence_window,
                sender: tx,
            }),
            transformer: Transformer::default(),
            stopped: AtomicBool::new(false),
            fatal: RwLock::new(None),
            timeout: RwLock::new(timeout),
            shutdown_handle,
            handles: Mutex::new(None),
        });

        let reader_worker = worker.clone();
        let reader = std::thread::spawn(move || reader_worker.loop_receive(reader_transport));
        let writer_worker = worker.clone();
        let writer = std::thread::spawn(move || writer_worker.loop_send(rx, transport));
        worker.handles.lock().unwrap().replace((reader, writer));

        Ok(worker)
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write().unwrap() = timeout;
    }

    /// The number of requests awaiting a terminal response.
    pub fn outstanding_request_count(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    /// Stops the worker, shutting down the connection.
    pub fn stop(&self) -> crate::Result<()> {
        log::debug!("Stopping worker.");
        self.stopped.store(true, Ordering::SeqCst);

        // Wake up the writer, then unblock the reader.
        {
            let send_state = self.send_state.lock().unwrap();
            let _ = send_state.sender.send(None);
        }
        self.shutdown_handle.disconnect()?;

        if let Some((reader, writer)) = self.handles.lock().unwrap().take() {
            reader
                .join()
                .map_err(|_| Error::InvalidState("Error stopping receiver".to_string()))?;
            writer
                .join()
                .map_err(|_| Error::InvalidState("Error stopping sender".to_string()))?;
        }

        // Anyone still waiting will not get a response anymore.
        self.drain_waiters();
        Ok(())
    }

    /// Sends a message: allocates its id from the sequence window, inserts
    /// the request into the outstanding table and hands the transformed
    /// frame to the writer thread, all under the send mutex. Returns the
    /// allocated message id.
    ///
    /// `SMB2_CANCEL` bypasses both the sequence window and the request
    /// table: it reuses whatever id the caller set on the header.
    pub fn send(&self, message: &mut PlainMessage, credit_charge: u16) -> crate::Result<u64> {
        if self.stopped() {
            return Err(self.latched_error());
        }

        let is_cancel = message.header.command == Command::Cancel;
        let mut send_state = self.send_state.lock().unwrap();

        if !is_cancel {
            let message_id = send_state.sequence_window.allocate(credit_charge);
            message.header.message_id = message_id;
            message.header.credit_charge = credit_charge;
            message.header.credit_request = credit_charge.max(1);
        }
        let message_id = message.header.message_id;

        let data = self.transformer.transform_outgoing(message)?;

        if !is_cancel {
            let mut state = self.state.lock().unwrap();
            state
                .outstanding
                .insert(message_id, RequestSlot::new(Request::new(message.clone())));
        }

        log::trace!("Message #{message_id} is passed to the worker for sending.");
        send_state
            .sender
            .send(Some(data))
            .map_err(|_| Error::NotConnected)?;

        Ok(message_id)
    }

    /// Waits for the terminal response to `message_id`.
    ///
    /// Interim `STATUS_PENDING` responses reset the response slot and keep
    /// the request in the table; the terminal response removes it. A
    /// terminal non-success status is surfaced as [`Error::ServerError`].
    pub fn receive(&self, message_id: u64) -> crate::Result<IncomingMessage> {
        loop {
            if let Some(fatal) = self.fatal.read().unwrap().as_ref() {
                return Err(Error::ConnectionFailed(fatal.clone()));
            }
            if self.stopped() {
                return Err(Error::NotConnected);
            }

            let stored_or_wait = {
                let mut state = self.state.lock().unwrap();
                let slot = state.outstanding.get_mut(&message_id).ok_or_else(|| {
                    Error::InvalidState(format!(
                        "No request with message id {message_id} is expecting a response"
                    ))
                })?;
                match slot.response.take() {
                    Some(response) => Err(response),
                    None => {
                        let (tx, rx) = mpsc::channel();
                        slot.waiter = Some(tx);
                        Ok(rx)
                    }
                }
            };

            let response = match stored_or_wait {
                Err(stored) => stored,
                Ok(rx) => self.wait_on_waiter(rx, message_id)?,
            };

            let incoming = match response {
                Ok(incoming) => incoming,
                Err(e) => {
                    // Errors delivered to a slot are terminal for it.
                    self.state.lock().unwrap().outstanding.remove(&message_id);
                    return Err(e);
                }
            };

            let status = incoming.message.header.status;
            if status == Status::U32_PENDING {
                log::trace!("Message #{message_id} is pending, awaiting the final response.");
                continue;
            }

            if let Some(slot) = self.state.lock().unwrap().outstanding.remove(&message_id) {
                log::trace!(
                    "Request #{message_id} completed in {:?}.",
                    slot.request.timestamp().elapsed()
                );
            }

            if status != Status::U32_SUCCESS {
                return Err(Error::ServerError {
                    message_id,
                    status,
                    header: incoming.message.header,
                });
            }
            return Ok(incoming);
        }
    }

    fn wait_on_waiter(
        &self,
        rx: mpsc::Receiver<crate::Result<IncomingMessage>>,
        message_id: u64,
    ) -> crate::Result<crate::Result<IncomingMessage>> {
        let timeout = *self.timeout.read().unwrap();
        let waited = if timeout == Duration::ZERO {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(timeout)
        };
        match waited {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                // The request stays in the table: a late response is still
                // routable and the caller may retry the receive.
                if let Some(slot) = self
                    .state
                    .lock()
                    .unwrap()
                    .outstanding
                    .get_mut(&message_id)
                {
                    slot.waiter = None;
                }
                Err(Error::OperationTimeout(
                    format!("Waiting for response to message {message_id}"),
                    timeout,
                ))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.latched_error()),
        }
    }

    fn latched_error(&self) -> Error {
        match self.fatal.read().unwrap().as_ref() {
            Some(fatal) => Error::ConnectionFailed(fatal.clone()),
            None => Error::NotConnected,
        }
    }

    /// Latches a fatal error and fans it out to every outstanding receiver.
    fn fail_all_waiters(&self, cause: Arc<Error>) {
        {
            let mut fatal = self.fatal.write().unwrap();
            fatal.get_or_insert_with(|| cause.clone());
        }
        self.stopped.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        for (message_id, slot) in state.outstanding.drain() {
            log::trace!("Failing outstanding message #{message_id}.");
            if let Some(waiter) = slot.waiter {
                let _ = waiter.send(Err(Error::ConnectionFailed(cause.clone())));
            }
        }
    }

    /// Wakes every outstanding receiver after a clean stop.
    fn drain_waiters(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, slot) in state.outstanding.drain() {
            if let Some(waiter) = slot.waiter {
                let _ = waiter.send(Err(Error::NotConnected));
            }
        }
    }

    /// Routes one response into its request's slot.
    fn route_incoming(&self, incoming: IncomingMessage) -> crate::Result<()> {
        let message_id = incoming.message.header.message_id;
        let mut state = self.state.lock().unwrap();
        let Some(slot) = state.outstanding.get_mut(&message_id) else {
            return Err(Error::InvalidMessage(format!(
                "Received a response with an unknown message id: {message_id}"
            )));
        };
        match slot.waiter.take() {
            Some(waiter) => {
                log::trace!("Waking up the receiver of message #{message_id}.");
                // A receiver that timed out leaves a dead channel behind;
                // keep the response in the slot for a retried receive.
                if let Err(returned) = waiter.send(Ok(incoming)) {
                    slot.response = Some(returned.0);
                }
            }
            None => {
                log::trace!("Storing the response to message #{message_id} until received.");
                slot.response = Some(Ok(incoming));
            }
        }
        Ok(())
    }

    /// Handles one inbound frame from the transport.
    fn handle_incoming(&self, frame: Vec<u8>) -> crate::Result<()> {
        let incoming = match self.transformer.transform_incoming(frame) {
            Ok(incoming) => incoming,
            Err(Error::TransformFailed(e)) => {
                // When the failure names a message id, its waiter learns the
                // precise cause; the connection still goes down right after,
                // by policy (a tampered stream is unrecoverable).
                if let Some(message_id) = e.msg_id {
                    let slot = self.state.lock().unwrap().outstanding.remove(&message_id);
                    if let Some(waiter) = slot.and_then(|slot| slot.waiter) {
                        let _ = waiter.send(Err(Error::TransformFailed(e)));
                        return Err(Error::InvalidState(
                            "The connection is unrecoverable after a transform failure"
                                .to_string(),
                        ));
                    }
                    return Err(Error::TransformFailed(e));
                }
                return Err(Error::TransformFailed(e));
            }
            Err(e) => return Err(e),
        };

        let header = &incoming.message.header;

        if header.message_id == Header::UNSOLICITED_MESSAGE_ID {
            // Unsolicited traffic (oplock breaks, notifications) is not
            // demultiplexed here.
            log::warn!(
                "Dropping unsolicited {} message from the server.",
                header.command
            );
            return Ok(());
        }

        if !header.flags.server_to_redir() {
            return Err(Error::InvalidMessage(
                "Received a message that is not a response".to_string(),
            ));
        }

        self.route_incoming(incoming)
    }

    /// The reader loop: drains the transport until the connection stops or
    /// fails. Any error here is fatal to the connection and is fanned out
    /// to all receivers.
    fn loop_receive(self: Arc<Self>, mut transport: Transport) {
        loop {
            let result = transport
                .receive_frame()
                .and_then(|frame| self.handle_incoming(frame));
            match result {
                Ok(()) => {}
                Err(Error::NotConnected) => {
                    if self.stopped() {
                        log::info!("Connection closed.");
                    } else {
                        log::error!("Connection closed by the server.");
                        self.fail_all_waiters(Arc::new(Error::NotConnected));
                    }
                    break;
                }
                Err(e) => {
                    log::error!("Fatal error in worker receive loop: {e}");
                    self.fail_all_waiters(Arc::new(e));
                    break;
                }
            }
        }
        log::debug!("Receive loop finished.");
    }

    /// The writer loop: writes frames to the transport in hand-off order.
    fn loop_send(self: Arc<Self>, rx: mpsc::Receiver<Option<Vec<u8>>>, mut transport: Transport) {
        loop {
            match rx.recv() {
                Ok(Some(frame)) => {
                    if let Err(e) = transport.send_frame(&frame) {
                        if self.stopped() {
                            log::info!("Connection closed.");
                        } else {
                            log::error!("Fatal error in worker send loop: {e}");
                            self.fail_all_waiters(Arc::new(e));
                        }
                        break;
                    }
                }
                // `None` wakes the loop up for shutdown.
                Ok(None) | Err(_) => break,
            }
        }
        log::debug!("Send loop finished.");
    }
}
