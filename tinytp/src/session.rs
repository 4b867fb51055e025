//! Async front end: one TinyTP connection owned by a tokio task.
//!
//! ```text
//!  Session (client handle)              LinkDriver (lower layer)
//!    │ Command::{Data, ...}                 ▲ LinkRequest      │ Command::Link
//!    ▼                                      │ (unbounded)      ▼
//!  ┌──────────────── mailbox (mpsc) ────────┴──────────────────────┐
//!  │ actor task: Connection<UnboundedSender<LinkRequest>>          │
//!  └───────────────────────────────┬───────────────────────────────┘
//!                                  ▼ Event (unbounded)
//!                           Session::next_event
//! ```
//!
//! Client requests and link completions share a single mailbox, so the
//! engine sees them strictly one at a time and needs no locking.  The task
//! exits on [`Session::close`] or once every command sender is gone.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigError};
use crate::connection::{ConnError, Connection};
use crate::event::Event;
use crate::link::{DeviceAddress, LinkCompletion, LinkRequest};
use crate::state::State;

/// Mailbox depth; senders wait when the actor falls this far behind.
const MAILBOX_DEPTH: usize = 64;

/// Errors seen by [`Session`] and [`LinkDriver`] callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The actor task has stopped.
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Conn(#[from] ConnError),
}

/// One message for the actor.
#[derive(Debug)]
enum Command {
    Discover {
        slots: u8,
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    Connect {
        addr: DeviceAddress,
        sap: u8,
        user_data: Vec<u8>,
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    Listen {
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    ConnectResponse {
        user_data: Vec<u8>,
        reply: oneshot::Sender<Result<(), ConnError>>,
    },
    Disconnect {
        user_data: Option<Vec<u8>>,
    },
    Data {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, ConnError>>,
    },
    ReturnCredit(usize),
    XmitQueueSize {
        max_packet_size: usize,
        reply: oneshot::Sender<usize>,
    },
    State {
        reply: oneshot::Sender<State>,
    },
    Link(LinkCompletion),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Client handle for a connection running on its own task.
pub struct Session {
    commands: mpsc::Sender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    handle: JoinHandle<()>,
}

/// Lower-layer end of a [`Session`]: drains link requests and reports
/// completions.
pub struct LinkDriver {
    requests: mpsc::UnboundedReceiver<LinkRequest>,
    completions: mpsc::Sender<Command>,
}

impl Session {
    /// Build a connection from `config` and start its actor task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: Config) -> Result<(Session, LinkDriver), ConfigError> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(config, link_tx)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(actor(conn, cmd_rx, event_tx));

        let session = Session {
            commands: cmd_tx.clone(),
            events: event_rx,
            handle,
        };
        let driver = LinkDriver {
            requests: link_rx,
            completions: cmd_tx,
        };
        Ok((session, driver))
    }

    pub async fn discover(&self, slots: u8) -> Result<(), SessionError> {
        Ok(self.call(|reply| Command::Discover { slots, reply }).await??)
    }

    pub async fn connect(
        &self,
        addr: DeviceAddress,
        sap: u8,
        user_data: &[u8],
    ) -> Result<(), SessionError> {
        let user_data = user_data.to_vec();
        Ok(self
            .call(|reply| Command::Connect {
                addr,
                sap,
                user_data,
                reply,
            })
            .await??)
    }

    pub async fn listen(&self) -> Result<(), SessionError> {
        Ok(self.call(|reply| Command::Listen { reply }).await??)
    }

    pub async fn connect_response(&self, user_data: &[u8]) -> Result<(), SessionError> {
        let user_data = user_data.to_vec();
        Ok(self
            .call(|reply| Command::ConnectResponse { user_data, reply })
            .await??)
    }

    /// Queue a disconnect; the outcome arrives as an event.
    pub async fn disconnect(&self, user_data: Option<&[u8]>) -> Result<(), SessionError> {
        let user_data = user_data.map(<[u8]>::to_vec);
        self.tell(Command::Disconnect { user_data }).await
    }

    /// Queue one SDU; returns the number of bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize, SessionError> {
        let data = data.to_vec();
        Ok(self.call(|reply| Command::Data { data, reply }).await??)
    }

    pub async fn return_credit(&self, byte_count: usize) -> Result<(), SessionError> {
        self.tell(Command::ReturnCredit(byte_count)).await
    }

    pub async fn xmit_queue_size(&self, max_packet_size: usize) -> Result<usize, SessionError> {
        self.call(|reply| Command::XmitQueueSize {
            max_packet_size,
            reply,
        })
        .await
    }

    pub async fn state(&self) -> Result<State, SessionError> {
        self.call(|reply| Command::State { reply }).await
    }

    /// Wait for the next indication.  `None` once the task has stopped and
    /// every queued event was taken.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Stop the actor task and wait for it to finish.
    pub async fn close(self) {
        // A full mailbox or a stopped task both end in the join below.
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.handle.await {
            log::error!("[ttp:session] actor task failed: {e}");
        }
    }

    async fn tell(&self, cmd: Command) -> Result<(), SessionError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tell(make(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

impl LinkDriver {
    /// Next request issued by the connection.  `None` once the actor is gone.
    pub async fn next_request(&mut self) -> Option<LinkRequest> {
        self.requests.recv().await
    }

    /// Report a completion back to the connection.
    pub async fn complete(&self, completion: LinkCompletion) -> Result<(), SessionError> {
        self.completions
            .send(Command::Link(completion))
            .await
            .map_err(|_| SessionError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

async fn actor(
    mut conn: Connection<mpsc::UnboundedSender<LinkRequest>>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(cmd) = commands.recv().await {
        if matches!(cmd, Command::Shutdown) {
            break;
        }
        apply(&mut conn, cmd);
        while let Some(event) = conn.poll_event() {
            if events.send(event).is_err() {
                log::trace!("[ttp:session] client gone; event dropped");
            }
        }
    }
    log::debug!("[ttp:session] stopped in {}", conn.state());
}

fn apply(conn: &mut Connection<mpsc::UnboundedSender<LinkRequest>>, cmd: Command) {
    // A dropped reply receiver means the caller stopped waiting.
    match cmd {
        Command::Discover { slots, reply } => {
            let _ = reply.send(conn.discover_request(slots));
        }
        Command::Connect {
            addr,
            sap,
            user_data,
            reply,
        } => {
            let _ = reply.send(conn.connect_request(addr, sap, &user_data));
        }
        Command::Listen { reply } => {
            let _ = reply.send(conn.listen_request());
        }
        Command::ConnectResponse { user_data, reply } => {
            let _ = reply.send(conn.connect_response(&user_data));
        }
        Command::Disconnect { user_data } => conn.disconnect_request(user_data.as_deref()),
        Command::Data { data, reply } => {
            let _ = reply.send(conn.data_request(&data));
        }
        Command::ReturnCredit(n) => conn.return_credit(n),
        Command::XmitQueueSize {
            max_packet_size,
            reply,
        } => {
            let _ = reply.send(conn.xmit_queue_size(max_packet_size));
        }
        Command::State { reply } => {
            let _ = reply.send(conn.state());
        }
        Command::Link(completion) => conn.handle_completion(completion),
        Command::Shutdown => {}
    }
}
