//! User-facing stream socket surface.
//!
//! The descriptor I/O operations exposed to the application layer, as
//! methods on [`SimHost`].  Everything is non-blocking: operations that
//! cannot progress return [`SockError::WouldBlock`], and readiness is
//! signalled through the descriptor status bits (see [`crate::status`]).
//!
//! Applications run inside simulation events, so the operations that can
//! touch the wire take the executing event's [`WorkerContext`].

use std::sync::Arc;

use slopsim_core::scheduler::WorkerContext;

use crate::host::{NetPayload, SimHost};
use crate::status::{DescriptorStatus, StatusListener};
use crate::tcp::{TcpConnection, TcpInfo};
use crate::types::{Port, ShutdownHow, SockAddr, SockError, SockHandle};

impl SimHost {
    /// Create a stream socket.  The returned handle is active but neither
    /// readable nor writable until `connect` or `listen` makes it so.
    pub fn open_stream(&mut self) -> SockHandle {
        let handle = self.alloc_handle();
        let local = self.addr(Port(0));
        let cfg = self.config();
        self.conns.insert(handle, TcpConnection::new(local, cfg));
        log::debug!("{handle}: opened");
        handle
    }

    /// Begin a non-blocking connect.  On success the connect is *in
    /// progress*: the error returned is [`SockError::InProgress`] and the
    /// descriptor turns writable once the handshake completes.
    pub fn connect(
        &mut self,
        handle: SockHandle,
        peer: SockAddr,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) -> Result<(), SockError> {
        let local_port = self
            .conns
            .get(&handle)
            .ok_or(SockError::BadHandle)?
            .local()
            .port;
        if local_port == Port(0) {
            let port = self.alloc_ephemeral();
            let conn = self.conns.get_mut(&handle).expect("present above");
            conn.local.port = port;
            self.ports.insert(port, handle);
        }
        self.drive(handle, ctx, |conn, env| conn.connect(peer, env))??;
        Err(SockError::InProgress)
    }

    /// Bind to `port` and start listening.
    pub fn listen(
        &mut self,
        handle: SockHandle,
        port: Port,
        backlog: usize,
    ) -> Result<(), SockError> {
        if self.ports.contains_key(&port) {
            return Err(SockError::InvalidState);
        }
        let conn = self.conns.get_mut(&handle).ok_or(SockError::BadHandle)?;
        conn.listen(backlog)?;
        conn.local.port = port;
        self.ports.insert(port, handle);
        Ok(())
    }

    /// Pop an established connection off the accept queue.
    pub fn accept(&mut self, handle: SockHandle) -> Result<(SockHandle, SockAddr), SockError> {
        let conn = self.conns.get_mut(&handle).ok_or(SockError::BadHandle)?;
        let server = conn.server.as_mut().ok_or(SockError::InvalidState)?;
        let Some((child, peer)) = server.backlog.pop_front() else {
            return Err(SockError::WouldBlock);
        };
        conn.refresh_status();
        log::debug!("{handle}: accepted {child} from {peer}");
        Ok((child, peer))
    }

    /// Queue bytes for transmission; returns how many were accepted.
    pub fn send(
        &mut self,
        handle: SockHandle,
        data: &[u8],
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) -> Result<usize, SockError> {
        self.drive(handle, ctx, |conn, env| conn.send_user_data(data, env))?
    }

    /// Read buffered in-order bytes; `Ok(0)` signals end-of-stream once.
    pub fn recv(
        &mut self,
        handle: SockHandle,
        buf: &mut [u8],
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) -> Result<usize, SockError> {
        self.drive(handle, ctx, |conn, env| conn.recv_user_data(buf, env))?
    }

    /// Shut down one or both directions.
    pub fn shutdown(
        &mut self,
        handle: SockHandle,
        how: ShutdownHow,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) -> Result<(), SockError> {
        self.drive(handle, ctx, |conn, env| conn.shutdown(how, env))?
    }

    /// Close the socket.  With unsent data queued, the FIN is deferred
    /// until the output drains.
    pub fn close(
        &mut self,
        handle: SockHandle,
        ctx: &mut WorkerContext<'_, NetPayload>,
    ) -> Result<(), SockError> {
        self.drive(handle, ctx, |conn, env| conn.close(env))
    }

    /// The `tcp_info`-shaped snapshot of a connection.
    pub fn get_info(&self, handle: SockHandle) -> Result<TcpInfo, SockError> {
        self.conns
            .get(&handle)
            .map(TcpConnection::info)
            .ok_or(SockError::BadHandle)
    }

    /// Handles of a listener's children (complete and incomplete), in no
    /// particular order.
    pub fn server_children(&self, handle: SockHandle) -> Result<Vec<SockHandle>, SockError> {
        let conn = self.conns.get(&handle).ok_or(SockError::BadHandle)?;
        let server = conn.server.as_ref().ok_or(SockError::InvalidState)?;
        Ok(server.children.values().copied().collect())
    }

    /// Current descriptor status bits.
    pub fn status(&self, handle: SockHandle) -> Result<DescriptorStatus, SockError> {
        self.conns
            .get(&handle)
            .map(TcpConnection::status)
            .ok_or(SockError::BadHandle)
    }

    /// Register a poll-like status waiter.
    pub fn add_status_listener(
        &mut self,
        handle: SockHandle,
        listener: Arc<StatusListener>,
    ) -> Result<(), SockError> {
        self.conns
            .get_mut(&handle)
            .map(|conn| conn.add_status_listener(listener))
            .ok_or(SockError::BadHandle)
    }

    /// Pin the send buffer size; opts the direction out of autotuning.
    pub fn set_send_buffer_size(
        &mut self,
        handle: SockHandle,
        bytes: usize,
    ) -> Result<(), SockError> {
        self.conns
            .get_mut(&handle)
            .map(|conn| conn.set_send_buffer(bytes))
            .ok_or(SockError::BadHandle)
    }

    /// Pin the receive buffer size; opts the direction out of autotuning.
    pub fn set_recv_buffer_size(
        &mut self,
        handle: SockHandle,
        bytes: usize,
    ) -> Result<(), SockError> {
        self.conns
            .get_mut(&handle)
            .map(|conn| conn.set_recv_buffer(bytes))
            .ok_or(SockError::BadHandle)
    }
}
