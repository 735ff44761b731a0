use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::state::SharedState;

struct Gate {
    remaining: usize,
    error: Option<CoreError>,
}

/// Releases the driving thread once every worker has finished, or as soon as
/// the first one reports a fatal error.
pub struct Barrier {
    gate: Mutex<Gate>,
    released: Condvar,
}

impl Barrier {
    pub fn new(workers: usize) -> Self {
        Self {
            gate: Mutex::new(Gate {
                remaining: workers,
                error: None,
            }),
            released: Condvar::new(),
        }
    }

    /// One ticket per worker. Dropping a ticket without arriving counts as a
    /// failure, so a panicking worker still releases the barrier.
    pub fn ticket(self: &Arc<Self>, worker: usize) -> BarrierTicket {
        BarrierTicket {
            barrier: Arc::clone(self),
            worker,
            arrived: false,
        }
    }

    fn arrive(&self, error: Option<CoreError>) {
        let Ok(mut gate) = self.gate.lock() else {
            return;
        };
        if let Some(err) = error {
            if gate.error.is_none() {
                gate.error = Some(err);
            }
        }
        gate.remaining = gate.remaining.saturating_sub(1);
        self.released.notify_all();
    }

    pub fn remaining(&self) -> usize {
        self.gate.lock().map(|gate| gate.remaining).unwrap_or(0)
    }

    pub fn wait(&self, state: &SharedState, slice: Duration) -> CoreResult<()> {
        let mut gate = self.gate.lock().map_err(|_| CoreError::poisoned("barrier"))?;
        while gate.remaining > 0 && gate.error.is_none() {
            if state.is_stopped() {
                return Err(CoreError::Canceled);
            }
            gate = self
                .released
                .wait_timeout(gate, slice)
                .map_err(|_| CoreError::poisoned("barrier"))?
                .0;
        }
        match &gate.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub struct BarrierTicket {
    barrier: Arc<Barrier>,
    worker: usize,
    arrived: bool,
}

impl BarrierTicket {
    pub fn arrive(mut self, error: Option<CoreError>) {
        self.arrived = true;
        self.barrier.arrive(error);
    }
}

impl Drop for BarrierTicket {
    fn drop(&mut self) {
        if !self.arrived {
            self.barrier.arrive(Some(CoreError::InvalidState(format!(
                "worker {} exited without reporting",
                self.worker
            ))));
        }
    }
}
