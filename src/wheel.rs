use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fire action armed with a wheel entry. Built once at scheduling time,
/// invoked at most once, on its own spawned task.
pub type Trigger = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub(crate) const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_BUCKETS: usize = 360;

/// Command channel depth. Senders briefly block when the wheel is busy.
const COMMAND_BUFFER_SIZE: usize = 128;

/// Hashed timer wheel driving one-shot delayed triggers.
///
/// Entries are parked in `buckets` slots; a heartbeat advances the cursor
/// one slot per tick and fires entries whose remaining rounds reach zero.
/// Resolution is one tick: delays are rounded up to a whole tick.
pub struct TimerWheel {
    /// Wheel resolution.
    tick: Duration,

    /// Slot -> ids parked there. Stale ids (cancelled or moved entries)
    /// are skipped when the slot drains.
    buckets: Vec<Vec<u64>>,

    /// Slot the heartbeat last drained.
    cursor: usize,

    /// Live entries by id.
    entries: HashMap<u64, WheelEntry>,

    /// Channel for receiving wheel commands
    command_rx: mpsc::Receiver<WheelCommand>,

    //// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

struct WheelEntry {
    /// Full rotations left before the entry is due.
    rounds: u64,
    /// Slot the entry currently belongs to.
    bucket: usize,
    trigger: Trigger,
}

enum WheelCommand {
    Schedule {
        id: u64,
        delay: Duration,
        trigger: Trigger,
    },
    Cancel {
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    Reschedule {
        id: u64,
        delay: Duration,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle for arming new wheel entries.
#[derive(Clone)]
pub struct WheelHandle {
    command_tx: mpsc::Sender<WheelCommand>,
    next_id: Arc<AtomicU64>,
}

/// Handle to a single armed entry.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    command_tx: mpsc::Sender<WheelCommand>,
}

impl TimerWheel {
    /// Create a new wheel with the given resolution and slot count.
    /// Zero values fall back to the defaults (1 s tick, 360 slots).
    ///
    /// Returns (TimerWheel, WheelHandle); spawn [`TimerWheel::run`] to
    /// start the heartbeat.
    pub fn new(
        tick: Duration,
        buckets: usize,
        cancel_token: CancellationToken,
    ) -> (Self, WheelHandle) {
        let tick = if tick.is_zero() { DEFAULT_TICK } else { tick };
        let buckets = if buckets == 0 { DEFAULT_BUCKETS } else { buckets };
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);

        let wheel = TimerWheel {
            tick,
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            cursor: 0,
            entries: HashMap::new(),
            command_rx,
            cancel_token,
        };

        let handle = WheelHandle {
            command_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        (wheel, handle)
    }

    /// Run the wheel heartbeat
    pub async fn run(mut self) {
        // First heartbeat one full tick from now; an immediate tick would
        // advance the cursor before anything can be parked.
        let mut heartbeat = interval_at(Instant::now() + self.tick, self.tick);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "timer wheel started ({} slots, {:?} tick)",
            self.buckets.len(),
            self.tick
        );

        loop {
            tokio::select! {
                // Handle incoming commands
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                },

                // Advance the cursor and fire due entries
                _ = heartbeat.tick() => {
                    self.advance();
                },

                // Handle cancellation token
                _ = self.cancel_token.cancelled() => {
                    log::info!("timer wheel cancelled via token");
                    break;
                },

                // All senders dropped
                else => {
                    log::info!("timer wheel shutting down - all senders dropped");
                    break;
                }
            }
        }

        log::info!("timer wheel stopped");
    }

    fn handle_command(&mut self, command: WheelCommand) {
        match command {
            WheelCommand::Schedule { id, delay, trigger } => {
                self.park(id, delay, trigger);
            }
            WheelCommand::Cancel { id, reply } => {
                let cancelled = self.entries.remove(&id).is_some();
                let _ = reply.send(cancelled);
            }
            WheelCommand::Reschedule { id, delay, reply } => {
                let moved = match self.entries.remove(&id) {
                    Some(entry) => {
                        self.park(id, delay, entry.trigger);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(moved);
            }
        }
    }

    /// Park `id` so it fires after `delay`, rounded up to a whole tick.
    fn park(&mut self, id: u64, delay: Duration, trigger: Trigger) {
        let slots = self.buckets.len() as u64;
        let tick = self.tick.as_nanos().max(1);
        let ticks = (delay.as_nanos().div_ceil(tick) as u64).max(1);

        let rounds = (ticks - 1) / slots;
        let bucket = ((self.cursor as u64 + ticks) % slots) as usize;

        self.entries.insert(
            id,
            WheelEntry {
                rounds,
                bucket,
                trigger,
            },
        );
        // A rescheduled entry may already be parked in this slot.
        if !self.buckets[bucket].contains(&id) {
            self.buckets[bucket].push(id);
        }
    }

    /// One heartbeat: move to the next slot and fire whatever is due there.
    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.buckets.len();
        let parked = std::mem::take(&mut self.buckets[self.cursor]);

        for id in parked {
            // Stale parking slots are skipped: the entry was cancelled, or
            // a reschedule moved it to a different slot.
            let due = match self.entries.get(&id) {
                Some(entry) if entry.bucket != self.cursor => continue,
                Some(entry) => entry.rounds == 0,
                None => continue,
            };

            if due {
                if let Some(entry) = self.entries.remove(&id) {
                    // Each trigger runs on its own task so a slow one
                    // cannot hold up the heartbeat or other entries.
                    tokio::spawn((entry.trigger)());
                }
            } else {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.rounds -= 1;
                }
                self.buckets[self.cursor].push(id);
            }
        }
    }
}

impl WheelHandle {
    /// Arm a one-shot entry that invokes `trigger` after `delay`.
    pub async fn schedule(&self, delay: Duration, trigger: Trigger) -> Result<TimerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.command_tx
            .send(WheelCommand::Schedule { id, delay, trigger })
            .await
            .map_err(|_| Error::EngineClosed)?;
        Ok(TimerHandle {
            id,
            command_tx: self.command_tx.clone(),
        })
    }
}

impl TimerHandle {
    /// Cancel the entry. Returns `true` iff it had not fired yet.
    pub async fn cancel(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(WheelCommand::Cancel {
                id: self.id,
                reply: reply_tx,
            })
            .await
            .is_ok();
        if !sent {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Move the entry to fire after `new_delay` instead. Returns `true`
    /// iff it was still pending.
    pub async fn reschedule(&self, new_delay: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(WheelCommand::Reschedule {
                id: self.id,
                delay: new_delay,
                reply: reply_tx,
            })
            .await
            .is_ok();
        if !sent {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}
