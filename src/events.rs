use crate::actions::{Action, ActionPool};
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, warn};

/// What a wait handle hears when its event resolves. Firing and cancellation
/// are distinct so an external waiter never hangs on a canceled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Fired { frame: u64 },
    Canceled,
}

/// Opaque handle for something outside the audio thread (a script, usually)
/// blocked until an event fires or is canceled.
#[derive(Debug)]
pub struct WaitHandle {
    tx: Sender<WaitOutcome>,
}

impl WaitHandle {
    pub fn new() -> (Self, Receiver<WaitOutcome>) {
        let (tx, rx) = crossbeam::channel::bounded(1);
        (Self { tx }, rx)
    }

    pub fn fire(&self, frame: u64) {
        let _ = self.tx.try_send(WaitOutcome::Fired { frame });
    }

    pub fn cancel(&self) {
        let _ = self.tx.try_send(WaitOutcome::Canceled);
    }
}

/// Closed set of event types. Behavior per type lives in the scheduler's
/// dispatch, not in a class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    None,
    /// A sync pulse injected into the block, processed before anything else
    /// on the same frame.
    Sync,
    /// Fire one deferred action.
    Action,
    /// Notify a waiter (and, when correlated, a follower track).
    Wait,
    /// Start or end recording, usually pending on a pulse.
    Record { end: bool },
    /// End (or extend) a Multiply/Insert at a rounding boundary.
    Round,
    /// Change the playing loop.
    Switch,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::None => "None",
            EventKind::Sync => "Sync",
            EventKind::Action => "Action",
            EventKind::Wait => "Wait",
            EventKind::Record { end: false } => "RecordStart",
            EventKind::Record { end: true } => "RecordEnd",
            EventKind::Round => "Round",
            EventKind::Switch => "Switch",
        }
    }
}

/// A scheduled operation. Owned by exactly one list at a time, or by the
/// pool, never both.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    /// Target frame within the current loop. Meaningless while `pending`.
    pub frame: u64,
    /// Frame not yet known; waiting on a pulse or a leader notification.
    pub pending: bool,
    /// Activation is driven by a sync pulse rather than a frame comparison.
    pub pulsed: bool,
    /// A Round event that extends the mode when reached instead of ending it.
    pub extension: bool,
    pub switch_target: usize,
    pub is_return: bool,
    /// Display counter for rounding modes; number of cycles added so far.
    pub multiples: u32,
    /// The action to execute when the event fires, if any.
    pub primary: Option<Box<Action>>,
    /// Actions accumulated while this event was the mode's closing point.
    pub stacked: Vec<Box<Action>>,
    /// Nonzero when this event is half of a leader/follower pair.
    pub correlation_id: u32,
    pub wait: Option<WaitHandle>,
    attached: bool,
}

impl Event {
    fn empty() -> Self {
        Self {
            kind: EventKind::None,
            frame: 0,
            pending: false,
            pulsed: false,
            extension: false,
            switch_target: 0,
            is_return: false,
            multiples: 0,
            primary: None,
            stacked: Vec::with_capacity(4),
            correlation_id: 0,
            wait: None,
            attached: false,
        }
    }

    /// Full re-initialization on the way back into the pool. The stacked
    /// vector keeps its capacity.
    fn pool_init(&mut self) {
        self.kind = EventKind::None;
        self.frame = 0;
        self.pending = false;
        self.pulsed = false;
        self.extension = false;
        self.switch_target = 0;
        self.is_return = false;
        self.multiples = 0;
        self.primary = None;
        self.stacked.clear();
        self.correlation_id = 0;
        self.wait = None;
        self.attached = false;
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Free-list allocator for events. Pre-warmed at construction; popping and
/// pushing boxes never touches the general heap in the steady state.
pub struct EventPool {
    free: Vec<Box<Event>>,
    outstanding: usize,
}

impl EventPool {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity * 2);
        for _ in 0..capacity {
            free.push(Box::new(Event::empty()));
        }
        Self {
            free,
            outstanding: 0,
        }
    }

    pub fn new_event(&mut self, kind: EventKind) -> Box<Event> {
        self.outstanding += 1;
        let mut event = match self.free.pop() {
            Some(e) => e,
            None => {
                warn!("event pool exhausted, growing");
                Box::new(Event::empty())
            }
        };
        event.kind = kind;
        event
    }

    /// Return an event to the pool, walking its stacked actions back to the
    /// action pool. Waiters must have been notified by the caller; a still
    /// attached waiter here means a cancellation path forgot to, so tell it
    /// rather than leave it hanging.
    pub fn dispose(&mut self, mut event: Box<Event>, actions: &mut ActionPool) {
        if event.attached {
            error!(event = event.name(), "disposing an event still on a list");
            event.attached = false;
        }
        if let Some(wait) = event.wait.take() {
            warn!(event = event.name(), "disposing an event with a live waiter");
            wait.cancel();
        }
        if let Some(primary) = event.primary.take() {
            actions.dispose(primary);
        }
        for action in event.stacked.drain(..) {
            actions.dispose(action);
        }
        event.pool_init();
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(event);
    }

    /// Cancellation: notify the waiter, then dispose.
    pub fn cancel(&mut self, mut event: Box<Event>, actions: &mut ActionPool) {
        if let Some(wait) = event.wait.take() {
            wait.cancel();
        }
        self.dispose(event, actions);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Frame-ordered event list for one track. Events on the same frame keep
/// insertion order except that priority (pulse) events go first.
pub struct EventList {
    events: Vec<Box<Event>>,
}

impl EventList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert ordered by frame. With `priority`, the event goes before any
    /// event already on the same frame; otherwise after them.
    ///
    /// Adding an event that believes it is already attached is a programming
    /// error: refused, handed back to the caller for disposal.
    pub fn add(&mut self, mut event: Box<Event>, priority: bool) -> Option<Box<Event>> {
        if event.attached {
            error!(event = event.name(), "add: event already on a list");
            return Some(event);
        }
        event.attached = true;
        let pos = if priority {
            self.events.partition_point(|e| e.frame < event.frame)
        } else {
            self.events.partition_point(|e| e.frame <= event.frame)
        };
        self.events.insert(pos, event);
        None
    }

    /// Remove and return the first non-pending event whose frame lies in
    /// `[start, end]` (inclusive). Callers loop, re-deriving the bounds as
    /// the track's frame advances under fired events.
    pub fn consume(&mut self, start: u64, end: u64) -> Option<Box<Event>> {
        let idx = self
            .events
            .iter()
            .position(|e| !e.pending && e.frame >= start && e.frame <= end)?;
        let mut event = self.events.remove(idx);
        event.attached = false;
        Some(event)
    }

    /// Remove and return the first event matching `pred`.
    pub fn consume_where<F: Fn(&Event) -> bool>(&mut self, pred: F) -> Option<Box<Event>> {
        let idx = self.events.iter().position(|e| pred(e))?;
        let mut event = self.events.remove(idx);
        event.attached = false;
        Some(event)
    }

    /// Remove and return the most recently scheduled event (the tail of the
    /// list); undo peels scheduled work off newest-first.
    pub fn consume_last(&mut self) -> Option<Box<Event>> {
        let mut event = self.events.pop()?;
        event.attached = false;
        Some(event)
    }

    /// Extract the event waiting on the next sync pulse. At most one is
    /// expected; more than one means scheduling got ahead of itself.
    pub fn consume_pulsed(&mut self) -> Option<Box<Event>> {
        let found = self.consume_where(|e| e.pending && e.pulsed);
        if found.is_some() && self.events.iter().any(|e| e.pending && e.pulsed) {
            warn!("more than one pulsed event was waiting");
        }
        found
    }

    /// Extract the pending event correlated with a leader notification.
    pub fn consume_pending_leader(&mut self, id: u32) -> Option<Box<Event>> {
        self.consume_where(|e| e.pending && e.correlation_id == id)
    }

    /// Called exactly once per loop-boundary crossing: pull every scheduled
    /// frame back by the loop length so events placed beyond the loop end
    /// land on the next pass. Events exactly at `delta` land at frame 0.
    /// Pending events have no meaningful frame and are left alone.
    pub fn shift(&mut self, delta: u64) {
        for event in &mut self.events {
            if event.pending {
                continue;
            }
            if event.frame < delta {
                warn!(
                    event = event.name(),
                    frame = event.frame,
                    delta,
                    "shift: unfired event before the loop boundary"
                );
                event.frame = 0;
            } else {
                event.frame -= delta;
            }
        }
    }

    pub fn find(&self, kind: EventKind) -> Option<&Event> {
        self.events.iter().map(|e| e.as_ref()).find(|e| e.kind == kind)
    }

    pub fn find_mut(&mut self, kind: EventKind) -> Option<&mut Event> {
        self.events
            .iter_mut()
            .map(|e| e.as_mut())
            .find(|e| e.kind == kind)
    }

    pub fn find_where<F: Fn(&Event) -> bool>(&self, pred: F) -> Option<&Event> {
        self.events.iter().map(|e| e.as_ref()).find(|e| pred(e))
    }

    pub fn find_mut_where<F: Fn(&Event) -> bool>(&mut self, pred: F) -> Option<&mut Event> {
        self.events.iter_mut().map(|e| e.as_mut()).find(|e| pred(e))
    }

    /// The last scheduled (non-pending) event for a given primary symbol, for
    /// quantization relative to an already-scheduled invocation.
    pub fn last_for_symbol(&self, symbol: crate::actions::Symbol) -> Option<&Event> {
        self.events
            .iter()
            .rev()
            .map(|e| e.as_ref())
            .find(|e| e.primary.as_ref().is_some_and(|a| a.symbol == symbol))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|e| e.as_ref())
    }

    /// Cancel everything: notify waiters of cancellation and return all
    /// events (and their actions) to the pools.
    pub fn clear(&mut self, pool: &mut EventPool, actions: &mut ActionPool) {
        debug!(count = self.events.len(), "clearing event list");
        while let Some(mut event) = self.events.pop() {
            event.attached = false;
            pool.cancel(event, actions);
        }
    }
}
