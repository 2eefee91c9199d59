// Copyright (c) The gauntlet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The private message bus.
//!
//! The bus is a Unix socket in the harness scratch directory, served by a
//! dedicated thread with its own Tokio runtime so that it outlives the
//! runtimes of individual test runs. Workers connect and claim a name derived
//! from their test UUID; the bus then routes the connection to the proxy
//! watching that UUID.

use super::protocol::{ProxyMessage, WorkerMessage, read_message, write_message};
use crate::errors::BusError;
use camino::{Utf8Path, Utf8PathBuf};
use gauntlet_metadata::{TestUuid, parse_worker_bus_name};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    thread::JoinHandle,
};
use tokio::{
    io::BufReader,
    net::{UnixListener, UnixStream},
    runtime::Runtime,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
        oneshot,
    },
};
use tracing::{debug, warn};

type Watchers = Arc<Mutex<HashMap<TestUuid, UnboundedSender<BusEvent>>>>;

/// A presence change or a message from a worker, delivered to its watcher.
#[derive(Debug)]
pub(crate) enum BusEvent {
    /// The worker claimed its name.
    Attached(WorkerLink),

    /// The worker sent a message.
    Message(WorkerMessage),

    /// The worker's connection closed.
    Detached,
}

/// The sending half of a worker connection.
#[derive(Clone, Debug)]
pub(crate) struct WorkerLink {
    outbound: UnboundedSender<ProxyMessage>,
}

impl WorkerLink {
    /// Queues a message for the worker. Returns false if the connection is
    /// gone.
    pub(crate) fn send(&self, message: ProxyMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// The private bus shared by all test runs of a harness.
pub struct Bus {
    address: Utf8PathBuf,
    watchers: Watchers,
    server: Mutex<Option<BusServer>>,
}

struct BusServer {
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl Bus {
    /// Binds the bus socket in `dir` and starts serving it.
    pub(crate) fn start(dir: &Utf8Path) -> Result<Self, BusError> {
        let address = dir.join("bus.sock");
        // A previous bus in the same directory may have left its socket behind.
        let _ = std::fs::remove_file(&address);
        let listener = std::os::unix::net::UnixListener::bind(&address)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|error| BusError::Bind {
                address: address.clone(),
                error,
            })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(BusError::Thread)?;
        let watchers = Watchers::default();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let server_watchers = watchers.clone();
        let thread = std::thread::Builder::new()
            .name("gauntlet-bus".to_owned())
            .spawn(move || serve(runtime, listener, server_watchers, shutdown_rx))
            .map_err(BusError::Thread)?;
        debug!(%address, "bus started");

        Ok(Self {
            address,
            watchers,
            server: Mutex::new(Some(BusServer { shutdown, thread })),
        })
    }

    /// The socket path workers connect to.
    pub fn address(&self) -> &Utf8Path {
        &self.address
    }

    /// Starts watching for the worker of `uuid`.
    ///
    /// The watch is removed when the returned handle is dropped.
    pub(crate) fn watch(&self, uuid: TestUuid) -> Result<BusWatch, BusError> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        let (sender, events) = unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid, sender);
        Ok(BusWatch {
            uuid,
            events,
            watchers: self.watchers.clone(),
        })
    }

    fn is_shut_down(&self) -> bool {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops serving and closes every worker connection.
    ///
    /// Blocks until the bus thread has exited. Calling this more than once
    /// does nothing.
    pub fn shutdown(&self) {
        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(server) = server else {
            return;
        };
        let _ = server.shutdown.send(());
        if server.thread.join().is_err() {
            warn!("bus thread panicked");
        }
        let _ = std::fs::remove_file(&self.address);
        debug!(address = %self.address, "bus shut down");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("address", &self.address)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Events for one test UUID.
#[derive(Debug)]
pub(crate) struct BusWatch {
    uuid: TestUuid,
    events: UnboundedReceiver<BusEvent>,
    watchers: Watchers,
}

impl BusWatch {
    /// Receives the next event. Cancel-safe.
    pub(crate) async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }
}

impl Drop for BusWatch {
    fn drop(&mut self) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.uuid);
    }
}

fn serve(
    runtime: Runtime,
    listener: std::os::unix::net::UnixListener,
    watchers: Watchers,
    mut shutdown: oneshot::Receiver<()>,
) {
    runtime.block_on(async move {
        let listener = match UnixListener::from_std(listener) {
            Ok(listener) => listener,
            Err(error) => {
                warn!(%error, "failed to register bus socket");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, watchers.clone()));
                    }
                    Err(error) => warn!(%error, "failed to accept bus connection"),
                },
            }
        }
    });
    // Dropping the runtime cancels the connection tasks and closes their
    // sockets.
}

async fn handle_connection(stream: UnixStream, watchers: Watchers) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    let name = match read_message::<_, WorkerMessage>(&mut reader, &mut line).await {
        Ok(Some(WorkerMessage::Hello { name })) => name,
        Ok(Some(other)) => {
            warn!(?other, "worker did not introduce itself, dropping connection");
            return;
        }
        Ok(None) => return,
        Err(error) => {
            warn!(%error, "failed to read worker introduction");
            return;
        }
    };
    let Some(uuid) = parse_worker_bus_name(&name) else {
        warn!(name, "worker claimed an invalid bus name");
        return;
    };
    let events = watchers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&uuid)
        .cloned();
    let Some(events) = events else {
        warn!(name, "no test is waiting for this worker");
        return;
    };

    let (outbound, mut outbound_rx) = unbounded_channel();
    if events
        .send(BusEvent::Attached(WorkerLink { outbound }))
        .is_err()
    {
        return;
    }
    debug!(name, "worker attached");

    let inbound = async {
        loop {
            match read_message::<_, WorkerMessage>(&mut reader, &mut line).await {
                Ok(Some(message)) => {
                    if events.send(BusEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(name, %error, "dropping worker connection");
                    break;
                }
            }
        }
    };
    let outbound = async {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(error) = write_message(&mut write, &message).await {
                debug!(name, %error, "failed to write to worker");
                break;
            }
        }
    };
    tokio::select! {
        () = inbound => {}
        () = outbound => {}
    }

    debug!(name, "worker detached");
    let _ = events.send(BusEvent::Detached);
}
