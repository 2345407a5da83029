//! Table-driven finite-state-machine execution
//!
//! Both protocol state machines (adjacency and ZTP) are instances of the
//! same engine: a static transition table mapping `(state, event)` to an
//! optional next state, an ordered action list, and an ordered list of
//! follow-up events, executed by [`Fsm::process`]. Actions are opaque
//! identifiers resolved through the owning [`Handler`]; the engine never
//! holds function pointers, so tables can be built before (and independently
//! of) the types whose methods ultimately run.
//!
//! Every `process` call appends a [`Record`] to a bounded history ring used
//! for diagnostics only. A `(state, event)` pair absent from the table is a
//! *missing transition*: logged, recorded with `implicit` set, and otherwise
//! without effect. This is distinct from an explicit self-transition, which
//! runs its actions but no entry or exit actions.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use tracing::{trace, warn};

/// Static description of one state machine kind
///
/// Implemented by unit marker types; the associated types carry the closed,
/// ordered identifier sets the tables are keyed by.
pub trait Machine {
    /// Closed set of state identifiers
    type State: Copy + Eq + Ord + fmt::Debug + 'static;
    /// Closed set of event identifiers
    type Event: Copy + Eq + Ord + fmt::Debug + 'static;
    /// Closed set of action identifiers, resolved by the handler
    type Action: Copy + fmt::Debug + 'static;
    /// Payload attached to some events
    type Data;

    /// Machine name used in log lines
    const NAME: &'static str;
}

/// Resolves action identifiers to their implementations
///
/// One match arm per action; `ctx` carries the queues, timers, and peer
/// views an action may touch. Actions must not block and are never skipped
/// or retried.
pub trait Handler<M: Machine, C> {
    /// Perform `action` in response to `cause`
    fn invoke(&mut self, action: M::Action, cause: Cause<'_, M>, ctx: &mut C);
}

/// Destination for the follow-up events a transition enqueues
pub trait EventSink<E> {
    /// Enqueue `event` for later delivery to the machine that produced it
    fn push(&mut self, event: E);
}

/// The event (and its payload) that led to an action being invoked
///
/// Entry actions run at machine start see `event: None`.
pub struct Cause<'a, M: Machine> {
    /// The event being processed, if any
    pub event: Option<M::Event>,
    /// The payload delivered with the event, if any
    pub data: Option<&'a M::Data>,
}

impl<'a, M: Machine> Cause<'a, M> {
    fn new(event: M::Event, data: Option<&'a M::Data>) -> Self {
        Self {
            event: Some(event),
            data,
        }
    }
}

/// One row of a transition table
pub struct Transition<M: Machine> {
    /// State entered when the transition runs; `None` means stay, without
    /// entry or exit actions
    pub next: Option<M::State>,
    /// Actions invoked, in order, before any state change
    pub actions: &'static [M::Action],
    /// Events enqueued after the actions run
    pub pushes: &'static [M::Event],
}

/// An immutable transition table plus per-state entry and exit actions
///
/// Built once by a factory function and shared by every instance of the
/// machine kind.
pub struct Table<M: Machine> {
    initial: M::State,
    rules: BTreeMap<(M::State, M::Event), Transition<M>>,
    entry: BTreeMap<M::State, &'static [M::Action]>,
    exit: BTreeMap<M::State, &'static [M::Action]>,
}

impl<M: Machine> Table<M> {
    /// Create an empty table whose machines start in `initial`
    pub fn new(initial: M::State) -> Self {
        Self {
            initial,
            rules: BTreeMap::new(),
            entry: BTreeMap::new(),
            exit: BTreeMap::new(),
        }
    }

    /// Add a transition for `(state, event)`
    pub fn rule(
        mut self,
        state: M::State,
        event: M::Event,
        next: Option<M::State>,
        actions: &'static [M::Action],
        pushes: &'static [M::Event],
    ) -> Self {
        let prev = self.rules.insert(
            (state, event),
            Transition {
                next,
                actions,
                pushes,
            },
        );
        debug_assert!(prev.is_none(), "duplicate rule for {state:?}/{event:?}");
        self
    }

    /// Set the actions run whenever `state` is entered from a different state
    pub fn on_entry(mut self, state: M::State, actions: &'static [M::Action]) -> Self {
        self.entry.insert(state, actions);
        self
    }

    /// Set the actions run whenever `state` is left for a different state
    pub fn on_exit(mut self, state: M::State, actions: &'static [M::Action]) -> Self {
        self.exit.insert(state, actions);
        self
    }

    /// The state machines start in
    pub fn initial(&self) -> M::State {
        self.initial
    }

    /// All transitions, ordered by `(state, event)`; introspection only
    pub fn rules(&self) -> impl Iterator<Item = (M::State, M::Event, &Transition<M>)> {
        self.rules.iter().map(|(&(s, e), t)| (s, e, t))
    }

    fn lookup(&self, state: M::State, event: M::Event) -> Option<&Transition<M>> {
        self.rules.get(&(state, event))
    }

    fn entry_actions(&self, state: M::State) -> &'static [M::Action] {
        self.entry.get(&state).copied().unwrap_or(&[])
    }

    fn exit_actions(&self, state: M::State) -> &'static [M::Action] {
        self.exit.get(&state).copied().unwrap_or(&[])
    }
}

/// One processed event, as retained in the diagnostic history
pub struct Record<M: Machine> {
    /// Process-wide sequence number of this record
    pub seq: u64,
    /// The `now` passed to the `process` call
    pub at: Instant,
    /// State the machine was in when the event arrived
    pub from: M::State,
    /// The event processed
    pub event: M::Event,
    /// Actions invoked, in invocation order (transition, then exit, then
    /// entry actions)
    pub actions: Vec<M::Action>,
    /// Follow-up events enqueued by the transition
    pub pushed: Vec<M::Event>,
    /// Next state named by the transition, if any
    pub to: Option<M::State>,
    /// Set when no transition was configured for `(from, event)`
    pub implicit: bool,
}

// Manual impl: a derive would demand `M` itself be `Debug`
impl<M: Machine> fmt::Debug for Record<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("seq", &self.seq)
            .field("from", &self.from)
            .field("event", &self.event)
            .field("actions", &self.actions)
            .field("pushed", &self.pushed)
            .field("to", &self.to)
            .field("implicit", &self.implicit)
            .finish()
    }
}

/// A running instance of a machine kind
///
/// Holds only the current state and the bounded history; the data the
/// actions operate on lives in the owning handler, so the two can be
/// borrowed independently.
pub struct Fsm<M: Machine> {
    state: M::State,
    history: VecDeque<Record<M>>,
    capacity: usize,
}

impl<M: Machine> Fsm<M> {
    /// Create an instance in `table`'s initial state
    ///
    /// No entry actions run until [`start`](Self::start).
    pub fn new(table: &Table<M>, capacity: usize) -> Self {
        Self {
            state: table.initial,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// The current state
    pub fn state(&self) -> M::State {
        self.state
    }

    /// Retained transition records, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Record<M>> {
        self.history.iter()
    }

    /// Run the initial state's entry actions, with no originating event
    pub fn start<H, C>(&mut self, table: &Table<M>, handler: &mut H, ctx: &mut C)
    where
        H: Handler<M, C>,
        C: EventSink<M::Event>,
    {
        trace!(machine = M::NAME, state = ?self.state, "starting");
        for &action in table.entry_actions(self.state) {
            handler.invoke(
                action,
                Cause {
                    event: None,
                    data: None,
                },
                ctx,
            );
        }
    }

    /// Process one event against the table
    ///
    /// Looks up the transition for the current state: invokes its actions in
    /// order, enqueues its follow-up events, and, only if it names a next
    /// state different from the current one, runs the old state's exit
    /// actions, switches, and runs the new state's entry actions. A missing
    /// transition is logged and recorded as implicit, with no other effect.
    pub fn process<H, C>(
        &mut self,
        table: &Table<M>,
        seq: u64,
        now: Instant,
        event: M::Event,
        data: Option<&M::Data>,
        handler: &mut H,
        ctx: &mut C,
    ) where
        H: Handler<M, C>,
        C: EventSink<M::Event>,
    {
        let from = self.state;
        let Some(rule) = table.lookup(from, event) else {
            warn!(
                machine = M::NAME,
                state = ?from,
                ?event,
                "no transition configured; ignoring event"
            );
            self.record(Record {
                seq,
                at: now,
                from,
                event,
                actions: Vec::new(),
                pushed: Vec::new(),
                to: None,
                implicit: true,
            });
            return;
        };
        trace!(machine = M::NAME, state = ?from, ?event, next = ?rule.next, "transition");

        let mut invoked: Vec<M::Action> = rule.actions.to_vec();
        for &action in rule.actions {
            handler.invoke(action, Cause::new(event, data), ctx);
        }
        for &pushed in rule.pushes {
            ctx.push(pushed);
        }
        if let Some(next) = rule.next {
            if next != from {
                for &action in table.exit_actions(from) {
                    invoked.push(action);
                    handler.invoke(action, Cause::new(event, data), ctx);
                }
                self.state = next;
                for &action in table.entry_actions(next) {
                    invoked.push(action);
                    handler.invoke(action, Cause::new(event, data), ctx);
                }
            }
        }
        self.record(Record {
            seq,
            at: now,
            from,
            event,
            actions: invoked,
            pushed: rule.pushes.to_vec(),
            to: rule.next,
            implicit: false,
        });
    }

    fn record(&mut self, record: Record<M>) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}
