//! # Hierarchical State Machine
//!
//! A table-driven state machine with one top-level transition table and any
//! number of nested tables keyed by a parent state. The dispatcher's
//! transfer engine drives its connection lifecycle with one of these; the
//! type is generic so any component can reuse it.
//!
//! ## Dispatch Order
//!
//! For an event, tables are consulted in insertion order: the top table
//! first, then the nested table attached to the top table's current state.
//! Within a table, entries are tried in declaration order; the first entry
//! whose (state, event) pair matches and whose guard (if any) passes wins.
//! A matching pair marks the event as hit even when every guard rejects it,
//! which stops the table walk. Events that match nothing are silently
//! dropped.
//!
//! ## Transitions
//!
//! A winning entry runs its action. Only when the target state differs
//! from the current one does the machine fire the exit hook of the old
//! state, switch state, and fire the entry hook of the new state.
//! Entering a state that owns a nested table resets that table to its
//! initial state.
//!
//! Guards must not mutate state. Actions may post further events through
//! whatever queue the caller controls, but the machine itself is not
//! re-entrant.

use crate::error::{Error, Result};

/// Identifier of a state.
pub type StateId = u32;

/// Identifier of an event.
pub type EventId = u32;

/// Sentinel state id: keys the top-level table, and as a transition target
/// means "stay".
pub const LAST_STATE_ID: StateId = u32::MAX;

/// Sentinel event id.
pub const LAST_EVENT_ID: EventId = u32::MAX;

/// Guard predicate: the transition applies only when this returns true.
pub type Guard<C> = fn(&C, EventId) -> bool;

/// Action run when a transition wins.
pub type Action<C> = fn(&C, EventId) -> Result<()>;

/// Hook run on state entry or exit.
pub type StateHook<C> = fn(&C, StateId, EventId) -> Result<()>;

/// One row of a transition table.
pub struct Transition<C> {
    /// State this row applies in.
    pub current: StateId,
    /// Event this row consumes.
    pub event: EventId,
    /// Optional guard; `None` always passes.
    pub guard: Option<Guard<C>>,
    /// Optional action.
    pub action: Option<Action<C>>,
    /// Target state; `LAST_STATE_ID` or the current state means no change.
    pub next: StateId,
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Transition<C> {}

struct Table<C> {
    /// Parent state this table belongs to; `LAST_STATE_ID` for the top table.
    state: StateId,
    initial: StateId,
    current: StateId,
    transitions: Vec<Transition<C>>,
}

struct Hooks<C> {
    state: StateId,
    on_entry: Option<StateHook<C>>,
    on_exit: Option<StateHook<C>>,
}

/// The state machine. `C` is the context handed to guards, actions and
/// hooks; the machine never stores it.
pub struct Hsm<C> {
    tables: Vec<Table<C>>,
    hooks: Vec<Hooks<C>>,
}

impl<C> Hsm<C> {
    /// Create the machine from its top-level table and initial state.
    pub fn new(top: Vec<Transition<C>>, initial: StateId) -> Hsm<C> {
        Hsm {
            tables: vec![Table {
                state: LAST_STATE_ID,
                initial,
                current: initial,
                transitions: top,
            }],
            hooks: Vec::new(),
        }
    }

    /// Attach (or replace) the nested table for `state`.
    ///
    /// The nested table's current state is forced to `initial` every time
    /// `state` is entered.
    pub fn add_state_transition(
        &mut self,
        state: StateId,
        transitions: Vec<Transition<C>>,
        initial: StateId,
    ) -> Result<()> {
        if state == LAST_STATE_ID {
            return Err(Error::InvalidParam("nested table on the sentinel state"));
        }
        if let Some(existing) = self.tables.iter_mut().find(|t| t.state == state) {
            existing.initial = initial;
            existing.current = initial;
            existing.transitions = transitions;
        } else {
            self.tables.push(Table {
                state,
                initial,
                current: initial,
                transitions,
            });
        }
        Ok(())
    }

    /// Attach (or replace) the entry/exit hooks for `state`.
    pub fn add_state_callback(
        &mut self,
        state: StateId,
        on_entry: Option<StateHook<C>>,
        on_exit: Option<StateHook<C>>,
    ) {
        if let Some(existing) = self.hooks.iter_mut().find(|h| h.state == state) {
            existing.on_entry = on_entry;
            existing.on_exit = on_exit;
        } else {
            self.hooks.push(Hooks {
                state,
                on_entry,
                on_exit,
            });
        }
    }

    /// The effective current state: the nested table's current state when
    /// the top-level current state owns one, the top-level state otherwise.
    pub fn current_state(&self) -> StateId {
        let top = self.tables[0].current;
        match self.tables.iter().find(|t| t.state == top) {
            Some(nested) => nested.current,
            None => top,
        }
    }

    /// Feed one event through the machine.
    pub fn process_event(&mut self, ctx: &C, event: EventId) -> Result<()> {
        let top_current = self.tables[0].current;
        for ti in 0..self.tables.len() {
            let applicable =
                self.tables[ti].state == LAST_STATE_ID || self.tables[ti].state == top_current;
            if !applicable {
                continue;
            }
            let mut hit = false;
            self.process_in_table(ti, ctx, event, &mut hit)?;
            if hit {
                break;
            }
        }
        Ok(())
    }

    fn process_in_table(
        &mut self,
        ti: usize,
        ctx: &C,
        event: EventId,
        hit: &mut bool,
    ) -> Result<()> {
        let cur = self.tables[ti].current;
        let mut winner: Option<Transition<C>> = None;
        for t in &self.tables[ti].transitions {
            if t.current == cur && t.event == event {
                *hit = true;
                if t.guard.map_or(true, |g| g(ctx, event)) {
                    winner = Some(*t);
                    break;
                }
            }
        }
        let t = match winner {
            Some(t) => t,
            None => return Ok(()),
        };
        if let Some(action) = t.action {
            action(ctx, event)?;
        }
        if t.next != LAST_STATE_ID && t.next != cur {
            self.fire_hook(ctx, cur, event, false)?;
            self.tables[ti].current = t.next;
            self.fire_hook(ctx, t.next, event, true)?;
            if let Some(nested) = self.tables.iter_mut().find(|tb| tb.state == t.next) {
                nested.current = nested.initial;
            }
        }
        Ok(())
    }

    fn fire_hook(&self, ctx: &C, state: StateId, event: EventId, entry: bool) -> Result<()> {
        let hooks = match self.hooks.iter().find(|h| h.state == state) {
            Some(h) => h,
            None => return Ok(()),
        };
        let hook = if entry { hooks.on_entry } else { hooks.on_exit };
        match hook {
            Some(f) => f(ctx, state, event),
            None => Ok(()),
        }
    }
}
