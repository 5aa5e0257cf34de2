//! Dual-port sensor link with live failover.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{parse_line, render_command, Incoming, SensorReply};
use super::{SensorError, SensorEvent, SensorOp, SensorPort};

/// Inbound poll interval of the port worker threads.
const PORT_POLL: Duration = Duration::from_millis(20);

/// Cap on outstanding replies a worker remembers.
const PENDING_CAP: usize = 64;

/// Tunables for [`SensorLink`].
#[derive(Debug, Clone)]
pub struct SensorLinkConfig {
    /// How long to wait for a reply on one port before failing over.
    pub reply_timeout: Duration,
}

impl Default for SensorLinkConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(1_000),
        }
    }
}

struct CmdRequest {
    id: u64,
    line: String,
    reply_tx: Sender<SensorReply>,
}

struct Shared {
    next_id: AtomicU64,
    active: AtomicUsize,
    stop: AtomicBool,
    subscribers: Mutex<Vec<Sender<SensorEvent>>>,
}

/// The sensor link: two port workers, one logical command surface.
///
/// Commands go out on the active port; a reply timeout fails over to the
/// other port and retries once with a fresh id. Unsolicited events from
/// both ports are fanned out to every subscriber.
pub struct SensorLink {
    shared: Arc<Shared>,
    cmd_txs: [Sender<CmdRequest>; 2],
    reply_timeout: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl SensorLink {
    /// Spawn workers for the two ports.
    pub fn spawn(
        primary: Box<dyn SensorPort>,
        secondary: Box<dyn SensorPort>,
        config: SensorLinkConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(2);
        let mut txs = Vec::with_capacity(2);
        for (slot, port) in [primary, secondary].into_iter().enumerate() {
            let (tx, rx) = unbounded();
            txs.push(tx);
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || {
                port_worker(port, rx, shared, slot);
            }));
        }
        let cmd_txs: [Sender<CmdRequest>; 2] = match txs.try_into() {
            Ok(a) => a,
            Err(_) => unreachable!("exactly two workers spawned"),
        };

        Self {
            shared,
            cmd_txs,
            reply_timeout: config.reply_timeout,
            workers,
        }
    }

    /// Subscribe to unsolicited sensor events.
    pub fn subscribe(&self) -> Receiver<SensorEvent> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Issue one operation; fail over once on a quiet port.
    pub fn op(&self, op: &SensorOp) -> Result<(), SensorError> {
        let first = self.shared.active.load(Ordering::Acquire);
        match self.op_on_port(op, first) {
            Ok(reply) => check_reply(op, reply),
            Err(SensorError::Timeout { .. }) => {
                let other = first ^ 1;
                warn!(op = op.name(), from = first, to = other, "sensor port failover");
                self.shared.active.store(other, Ordering::Release);
                let reply = self.op_on_port(op, other)?;
                check_reply(op, reply)
            }
            Err(e) => Err(e),
        }
    }

    fn op_on_port(&self, op: &SensorOp, slot: usize) -> Result<SensorReply, SensorError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let line = render_command(id, op);
        let (reply_tx, reply_rx) = unbounded();
        self.cmd_txs[slot]
            .send(CmdRequest { id, line, reply_tx })
            .map_err(|_| SensorError::Stopped)?;

        reply_rx
            .recv_timeout(self.reply_timeout)
            .map_err(|_| SensorError::Timeout {
                op: op.name().to_string(),
            })
    }

    /// Time alignment.
    pub fn sync(&self, t_host_us: u64) -> Result<(), SensorError> {
        self.op(&SensorOp::Sync { t_host_us })
    }

    /// Begin streaming data events.
    pub fn start(&self) -> Result<(), SensorError> {
        self.op(&SensorOp::Start)
    }

    /// Stop streaming.
    pub fn stop_stream(&self) -> Result<(), SensorError> {
        self.op(&SensorOp::Stop)
    }

    /// Currently active port slot (0 = primary).
    pub fn active_port(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }
}

impl Drop for SensorLink {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn check_reply(op: &SensorOp, reply: SensorReply) -> Result<(), SensorError> {
    if reply.ok {
        Ok(())
    } else {
        Err(SensorError::Rejected {
            op: op.name().to_string(),
            message: reply.message.unwrap_or_else(|| "unspecified".to_string()),
        })
    }
}

fn port_worker(
    mut port: Box<dyn SensorPort>,
    cmd_rx: Receiver<CmdRequest>,
    shared: Arc<Shared>,
    slot: usize,
) {
    let name = port.name().to_string();
    info!(port = %name, slot, "sensor port worker up");
    let mut pending: BTreeMap<u64, Sender<SensorReply>> = BTreeMap::new();

    while !shared.stop.load(Ordering::Acquire) {
        // Flush queued commands first so replies can correlate.
        while let Ok(req) = cmd_rx.try_recv() {
            match port.send_line(&req.line) {
                Ok(()) => {
                    pending.insert(req.id, req.reply_tx);
                    // Oldest ids are stale callers that already gave up.
                    while pending.len() > PENDING_CAP {
                        pending.pop_first();
                    }
                }
                Err(e) => {
                    warn!(port = %name, error = %e, "sensor send failed");
                }
            }
        }

        match port.recv_line(PORT_POLL) {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Incoming::Reply(reply)) => {
                    if let Some(tx) = pending.remove(&reply.id) {
                        let _ = tx.send(reply);
                    } else {
                        debug!(port = %name, id = reply.id, "uncorrelated sensor reply");
                    }
                }
                Ok(Incoming::Event(event)) => fanout(&shared, event),
                Err(e) => debug!(port = %name, error = %e, "unparseable sensor line"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(port = %name, error = %e, "sensor recv failed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    info!(port = %name, slot, "sensor port worker down");
}

fn fanout(shared: &Shared, event: SensorEvent) {
    shared
        .subscribers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}
