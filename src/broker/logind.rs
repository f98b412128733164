//! logind binding over the system bus
//!
//! D-Bus communication runs in a separate thread (tokio runtime),
//! communicating with the main thread via mpsc channels. Requests from the
//! main thread wait for their reply with a timeout; seat signals are pushed
//! to a subscriber and announced through its [`Waker`].

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};

use super::{LoginBroker, SeatChange, SeatInfo};
use crate::constants::{BROKER_CONNECT_TIMEOUT, BROKER_REPLY_TIMEOUT};
use crate::mainloop::Waker;

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait Login1Manager {
    fn list_seats(&self) -> zbus::Result<Vec<(String, zbus::zvariant::OwnedObjectPath)>>;

    #[zbus(name = "GetSessionByPID")]
    fn get_session_by_pid(&self, pid: u32) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    #[zbus(signal)]
    fn seat_new(&self, seat_id: &str, object_path: zbus::zvariant::ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn seat_removed(&self, seat_id: &str, object_path: zbus::zvariant::ObjectPath<'_>) -> zbus::Result<()>;
}

/// Request from the main thread to the broker thread
enum BrokerRequest {
    ListSeats(mpsc::Sender<Result<Vec<SeatInfo>>>),
    SessionForPid(u32, mpsc::Sender<Result<String>>),
    Subscribe(mpsc::Sender<SeatChange>, Arc<Waker>),
}

/// Held by the main thread
pub struct LogindBroker {
    request_tx: tokio::sync::mpsc::Sender<BrokerRequest>,
    /// Broker thread (terminates when request_tx is dropped)
    _thread: std::thread::JoinHandle<()>,
}

impl LogindBroker {
    /// Connect to logind on the system bus (3 second timeout)
    pub fn connect() -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (request_tx, request_rx) = tokio::sync::mpsc::channel::<BrokerRequest>(16);

        let thread = std::thread::Builder::new()
            .name("seatwarden-logind".into())
            .spawn(move || {
                broker_thread(request_rx, ready_tx);
            })
            .map_err(|e| anyhow!("Failed to start logind thread: {}", e))?;

        match ready_rx.recv_timeout(BROKER_CONNECT_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow!("logind connection timeout")),
        }

        Ok(Self {
            request_tx,
            _thread: thread,
        })
    }

    fn request<T>(&self, make: impl FnOnce(mpsc::Sender<Result<T>>) -> BrokerRequest) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .try_send(make(reply_tx))
            .map_err(|e| anyhow!("logind thread unavailable: {}", e))?;
        reply_rx
            .recv_timeout(BROKER_REPLY_TIMEOUT)
            .map_err(|_| anyhow!("logind request timed out"))?
    }
}

impl LoginBroker for LogindBroker {
    fn list_seats(&self) -> Result<Vec<SeatInfo>> {
        self.request(BrokerRequest::ListSeats)
    }

    fn session_for_pid(&self, pid: u32) -> Result<String> {
        self.request(|reply| BrokerRequest::SessionForPid(pid, reply))
    }

    fn subscribe_seat_changes(&self, waker: Arc<Waker>) -> Result<mpsc::Receiver<SeatChange>> {
        let (change_tx, change_rx) = mpsc::channel();
        self.request_tx
            .try_send(BrokerRequest::Subscribe(change_tx, waker))
            .map_err(|e| anyhow!("logind thread unavailable: {}", e))?;
        Ok(change_rx)
    }
}

type Subscriber = (mpsc::Sender<SeatChange>, Arc<Waker>);

fn notify(subscriber: &Option<Subscriber>, change: SeatChange) {
    if let Some((tx, waker)) = subscriber {
        if tx.send(change).is_ok() {
            waker.wake();
        }
    }
}

/// Broker thread main function
fn broker_thread(
    request_rx: tokio::sync::mpsc::Receiver<BrokerRequest>,
    ready_tx: mpsc::Sender<Result<()>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("Failed to create tokio runtime: {}", e)));
            return;
        }
    };

    rt.block_on(async move {
        match broker_async_main(request_rx, ready_tx).await {
            Ok(()) => info!("logind thread terminated normally"),
            Err(e) => warn!("logind thread error: {}", e),
        }
    });
}

/// Broker thread async main
async fn broker_async_main(
    mut request_rx: tokio::sync::mpsc::Receiver<BrokerRequest>,
    ready_tx: mpsc::Sender<Result<()>>,
) -> Result<()> {
    let connection = match zbus::Connection::system().await {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("Failed to connect to D-Bus system bus: {}", e)));
            return Ok(());
        }
    };

    let manager = match Login1ManagerProxy::new(&connection).await {
        Ok(p) => p,
        Err(e) => {
            let _ = ready_tx.send(Err(anyhow!("Failed to create logind proxy: {}", e)));
            return Ok(());
        }
    };

    let mut seat_new_stream = manager.receive_seat_new().await?;
    let mut seat_removed_stream = manager.receive_seat_removed().await?;

    let _ = ready_tx.send(Ok(()));
    info!("Connected to logind");

    let mut subscriber: Option<Subscriber> = None;

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else {
                    // Main thread dropped the broker
                    return Ok(());
                };
                match request {
                    BrokerRequest::ListSeats(reply) => {
                        let result = manager
                            .list_seats()
                            .await
                            .map(|seats| {
                                seats
                                    .into_iter()
                                    .map(|(id, path)| SeatInfo { id, path: path.as_str().to_string() })
                                    .collect()
                            })
                            .map_err(|e| anyhow!("ListSeats failed: {}", e));
                        let _ = reply.send(result);
                    }
                    BrokerRequest::SessionForPid(pid, reply) => {
                        let result = manager
                            .get_session_by_pid(pid)
                            .await
                            .map(|path| path.as_str().to_string())
                            .map_err(|e| anyhow!("GetSessionByPID({}) failed: {}", pid, e));
                        let _ = reply.send(result);
                    }
                    BrokerRequest::Subscribe(tx, waker) => {
                        debug!("Seat change subscriber registered");
                        subscriber = Some((tx, waker));
                    }
                }
            }

            // SeatNew signal
            Some(signal) = async { seat_new_stream.next().await } => {
                match signal.args() {
                    Ok(args) => {
                        let seat = SeatInfo {
                            id: args.seat_id().to_string(),
                            path: args.object_path().to_string(),
                        };
                        debug!("logind SeatNew: {}", seat.id);
                        notify(&subscriber, SeatChange::Added(seat));
                    }
                    Err(e) => warn!("SeatNew parse error: {}", e),
                }
            }

            // SeatRemoved signal
            Some(signal) = async { seat_removed_stream.next().await } => {
                match signal.args() {
                    Ok(args) => {
                        let seat = SeatInfo {
                            id: args.seat_id().to_string(),
                            path: args.object_path().to_string(),
                        };
                        debug!("logind SeatRemoved: {}", seat.id);
                        notify(&subscriber, SeatChange::Removed(seat));
                    }
                    Err(e) => warn!("SeatRemoved parse error: {}", e),
                }
            }
        }
    }
}
