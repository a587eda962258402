// crates/canopen-rs/src/tmr.rs

use crate::hal::CanopenError;
use alloc::vec::Vec;
use log::trace;

/// Timer durations are counted in wheel ticks (1 tick = 1 ms).
pub type Ticks = u32;

/// Handle returned by [`TimerWheel::create`], used to cancel a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmrHandle(pub(crate) u16);

/// The work a timer performs when it elapses.
///
/// Callbacks are carried as values instead of function pointers so that all
/// protocol work stays in main-loop context: [`TimerWheel::process`] hands
/// the elapsed actions back to the node, which dispatches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Emit one heartbeat frame.
    Heartbeat,
    /// The event timer of TPDO `n` elapsed.
    TpdoEvent(u16),
    /// The inhibit window of TPDO `n` ended.
    TpdoInhibit(u16),
    /// The transfer timeout of SDO server channel `k` expired.
    SdoServerTimeout(u8),
    /// The transfer timeout of SDO client channel `k` expired.
    SdoClientTimeout(u8),
}

struct ActionSlot {
    id: u16,
    action: TimerAction,
    cycle: Ticks,
    next: Option<usize>,
}

struct EventSlot {
    /// Delta ticks from the previous event in the list.
    delta: Ticks,
    head: usize,
    tail: usize,
    next: Option<usize>,
}

/// A delta-list timer wheel at millisecond granularity.
///
/// A single ordered list of pending events holds the delta ticks to the
/// previous event; events that elapse at the same absolute time share one
/// slot and chain their actions, so firing is O(1) and insertion is O(n)
/// with n the number of distinct deadlines (small by design).
///
/// Two contexts touch the wheel: the tick source calls [`service`] once per
/// millisecond, the main loop calls [`process`]. Both take `&mut self`; the
/// owner is responsible for keeping the two calls from interleaving (on a
/// bare-metal target, a brief critical section around `service`).
///
/// [`service`]: TimerWheel::service
/// [`process`]: TimerWheel::process
pub struct TimerWheel {
    events: Vec<Option<EventSlot>>,
    actions: Vec<Option<ActionSlot>>,
    free_events: Vec<usize>,
    free_actions: Vec<usize>,
    used: Option<usize>,
    elapsed: Option<usize>,
    next_id: u16,
}

impl TimerWheel {
    /// Creates a wheel with room for `capacity` simultaneous actions.
    /// Both pools are pre-sized here; nothing grows afterwards.
    pub fn new(capacity: usize) -> Self {
        let mut events = Vec::with_capacity(capacity);
        let mut actions = Vec::with_capacity(capacity);
        let mut free_events = Vec::with_capacity(capacity);
        let mut free_actions = Vec::with_capacity(capacity);
        for i in 0..capacity {
            events.push(None);
            actions.push(None);
            // Pop order matches slot order; purely cosmetic.
            free_events.push(capacity - 1 - i);
            free_actions.push(capacity - 1 - i);
        }
        Self {
            events,
            actions,
            free_events,
            free_actions,
            used: None,
            elapsed: None,
            next_id: 0,
        }
    }

    /// Number of free action slots left in the pool.
    pub fn free_slots(&self) -> usize {
        self.free_actions.len()
    }

    /// Schedules an action after `start` ticks. A non-zero `cycle` re-arms
    /// the action with that period each time it fires; `cycle == 0` makes it
    /// a one-shot. A zero `start` with a non-zero `cycle` starts after one
    /// full cycle.
    pub fn create(
        &mut self,
        start: Ticks,
        cycle: Ticks,
        action: TimerAction,
    ) -> Result<TmrHandle, CanopenError> {
        let start = if start == 0 { cycle } else { start };
        if start == 0 {
            return Err(CanopenError::Argument);
        }
        let action_idx = self.alloc_action(action, cycle)?;
        let id = self.actions[action_idx].as_ref().map(|a| a.id).unwrap_or(0);
        self.insert(start, action_idx)?;
        trace!("timer {} armed: start={} cycle={}", id, start, cycle);
        Ok(TmrHandle(id))
    }

    /// Cancels a pending action before it fires.
    pub fn delete(&mut self, handle: TmrHandle) -> Result<(), CanopenError> {
        if self.unlink_action(handle.0) {
            trace!("timer {} deleted", handle.0);
            Ok(())
        } else {
            Err(CanopenError::TimerNotFound)
        }
    }

    /// Cancels every pending and elapsed action. Used on communication reset.
    pub fn clear(&mut self) {
        let capacity = self.events.len();
        for slot in self.events.iter_mut() {
            *slot = None;
        }
        for slot in self.actions.iter_mut() {
            *slot = None;
        }
        self.free_events.clear();
        self.free_actions.clear();
        for i in 0..capacity {
            self.free_events.push(capacity - 1 - i);
            self.free_actions.push(capacity - 1 - i);
        }
        self.used = None;
        self.elapsed = None;
    }

    /// Advances the wheel by one tick. Called from the tick source only; it
    /// does nothing but decrement the head delta and move an elapsed event
    /// onto the elapsed chain, so it is safe at interrupt priority.
    ///
    /// Returns true when an event elapsed and [`TimerWheel::process`] has
    /// work to do.
    pub fn service(&mut self) -> bool {
        let Some(head) = self.used else {
            return false;
        };
        let delta = {
            let ev = self.events[head].as_mut().expect("used list slot");
            ev.delta = ev.delta.saturating_sub(1);
            ev.delta
        };
        if delta > 0 {
            return false;
        }
        // Detach the head and append it to the elapsed chain. Events never
        // share a delta of zero because equal deadlines merge on insert.
        let next = self.events[head].as_mut().expect("used list slot").next.take();
        self.used = next;
        self.append_elapsed(head);
        true
    }

    /// Runs all elapsed actions, re-arming cyclic ones. Called from the main
    /// loop. The elapsed actions are returned for the owner to dispatch;
    /// within one tick they come back in insertion order.
    pub fn process(&mut self) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while let Some(ev_idx) = self.elapsed {
            let ev = self.events[ev_idx].take().expect("elapsed slot");
            self.elapsed = ev.next;
            self.free_events.push(ev_idx);

            let mut act = Some(ev.head);
            while let Some(act_idx) = act {
                let (action, cycle, next) = {
                    let slot = self.actions[act_idx].as_ref().expect("action slot");
                    (slot.action, slot.cycle, slot.next)
                };
                fired.push(action);
                if cycle > 0 {
                    self.actions[act_idx].as_mut().expect("action slot").next = None;
                    // Re-arm errors cannot happen: the slot is already ours.
                    let _ = self.insert(cycle, act_idx);
                } else {
                    self.actions[act_idx] = None;
                    self.free_actions.push(act_idx);
                }
                act = next;
            }
        }
        fired
    }

    /// True while the given handle is pending (not yet fired or cancelled).
    pub fn is_pending(&self, handle: TmrHandle) -> bool {
        self.find_action(handle.0).is_some()
    }

    fn alloc_action(&mut self, action: TimerAction, cycle: Ticks) -> Result<usize, CanopenError> {
        let idx = self
            .free_actions
            .pop()
            .ok_or(CanopenError::TimerExhausted)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.actions[idx] = Some(ActionSlot {
            id,
            action,
            cycle,
            next: None,
        });
        Ok(idx)
    }

    /// Inserts the given action `ticks` from now into the delta list.
    fn insert(&mut self, ticks: Ticks, action_idx: usize) -> Result<(), CanopenError> {
        let mut remaining = ticks;
        let mut prev: Option<usize> = None;
        let mut cur = self.used;

        loop {
            match cur {
                None => {
                    let ev_idx = self.alloc_event(remaining, action_idx)?;
                    match prev {
                        None => self.used = Some(ev_idx),
                        Some(p) => self.events[p].as_mut().expect("event slot").next = Some(ev_idx),
                    }
                    return Ok(());
                }
                Some(i) => {
                    let delta = self.events[i].as_ref().expect("event slot").delta;
                    if remaining < delta {
                        // New event fires before this one: splice in front and
                        // shorten the follower's delta.
                        let ev_idx = self.alloc_event(remaining, action_idx)?;
                        self.events[ev_idx].as_mut().expect("event slot").next = Some(i);
                        self.events[i].as_mut().expect("event slot").delta = delta - remaining;
                        match prev {
                            None => self.used = Some(ev_idx),
                            Some(p) => {
                                self.events[p].as_mut().expect("event slot").next = Some(ev_idx)
                            }
                        }
                        return Ok(());
                    }
                    if remaining == delta {
                        // Same absolute deadline: chain onto the existing event.
                        let tail = self.events[i].as_ref().expect("event slot").tail;
                        self.actions[tail].as_mut().expect("action slot").next = Some(action_idx);
                        self.events[i].as_mut().expect("event slot").tail = action_idx;
                        return Ok(());
                    }
                    remaining -= delta;
                    prev = cur;
                    cur = self.events[i].as_ref().expect("event slot").next;
                }
            }
        }
    }

    fn alloc_event(&mut self, delta: Ticks, action_idx: usize) -> Result<usize, CanopenError> {
        let idx = match self.free_events.pop() {
            Some(idx) => idx,
            None => {
                // Give the action slot back so the pools stay paired.
                self.actions[action_idx] = None;
                self.free_actions.push(action_idx);
                return Err(CanopenError::TimerExhausted);
            }
        };
        self.events[idx] = Some(EventSlot {
            delta,
            head: action_idx,
            tail: action_idx,
            next: None,
        });
        Ok(idx)
    }

    fn append_elapsed(&mut self, ev_idx: usize) {
        self.events[ev_idx].as_mut().expect("event slot").next = None;
        match self.elapsed {
            None => self.elapsed = Some(ev_idx),
            Some(mut cur) => loop {
                let next = self.events[cur].as_ref().expect("elapsed slot").next;
                match next {
                    Some(n) => cur = n,
                    None => {
                        self.events[cur].as_mut().expect("elapsed slot").next = Some(ev_idx);
                        break;
                    }
                }
            },
        }
    }

    fn find_action(&self, id: u16) -> Option<usize> {
        self.actions
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|a| a.id == id))
    }

    /// Removes the action with the given id from whichever list holds it.
    /// Returns false when the id is not pending.
    fn unlink_action(&mut self, id: u16) -> bool {
        for in_used in [true, false] {
            let list = if in_used { self.used } else { self.elapsed };
            let mut prev_ev: Option<usize> = None;
            let mut cur_ev = list;
            while let Some(ev_idx) = cur_ev {
                if self.unlink_action_from_event(ev_idx, id) {
                    if self.actions_empty(ev_idx) {
                        self.remove_event(in_used, prev_ev, ev_idx);
                    }
                    return true;
                }
                prev_ev = cur_ev;
                cur_ev = self.events[ev_idx].as_ref().expect("event slot").next;
            }
        }
        false
    }

    fn actions_empty(&self, ev_idx: usize) -> bool {
        let ev = self.events[ev_idx].as_ref().expect("event slot");
        self.actions[ev.head].is_none()
    }

    /// Unlinks action `id` from the chain of event `ev_idx`. Returns true on
    /// success. The event's head/tail are fixed up; an emptied chain leaves
    /// head pointing at a freed slot, detected by `actions_empty`.
    fn unlink_action_from_event(&mut self, ev_idx: usize, id: u16) -> bool {
        let head = self.events[ev_idx].as_ref().expect("event slot").head;
        let mut prev: Option<usize> = None;
        let mut cur = Some(head);
        while let Some(act_idx) = cur {
            let slot = match self.actions[act_idx].as_ref() {
                Some(s) => s,
                None => return false,
            };
            if slot.id == id {
                let next = slot.next;
                match prev {
                    None => {
                        if let Some(n) = next {
                            self.events[ev_idx].as_mut().expect("event slot").head = n;
                        }
                    }
                    Some(p) => {
                        self.actions[p].as_mut().expect("action slot").next = next;
                        if next.is_none() {
                            self.events[ev_idx].as_mut().expect("event slot").tail = p;
                        }
                    }
                }
                self.actions[act_idx] = None;
                self.free_actions.push(act_idx);
                return true;
            }
            prev = cur;
            cur = slot.next;
        }
        false
    }

    /// Removes an emptied event slot, merging its delta into the follower
    /// when it sat in the pending list.
    fn remove_event(&mut self, in_used: bool, prev: Option<usize>, ev_idx: usize) {
        let ev = self.events[ev_idx].take().expect("event slot");
        if in_used {
            if let Some(next) = ev.next {
                self.events[next].as_mut().expect("event slot").delta += ev.delta;
            }
            match prev {
                None => self.used = ev.next,
                Some(p) => self.events[p].as_mut().expect("event slot").next = ev.next,
            }
        } else {
            match prev {
                None => self.elapsed = ev.next,
                Some(p) => self.events[p].as_mut().expect("event slot").next = ev.next,
            }
        }
        self.free_events.push(ev_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(wheel: &mut TimerWheel, n: u32) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        for _ in 0..n {
            if wheel.service() {
                fired.extend(wheel.process());
            }
        }
        fired
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut wheel = TimerWheel::new(4);
        wheel.create(3, 0, TimerAction::Heartbeat).unwrap();
        assert!(tick(&mut wheel, 2).is_empty());
        assert_eq!(tick(&mut wheel, 1), [TimerAction::Heartbeat]);
        assert!(tick(&mut wheel, 10).is_empty());
    }

    #[test]
    fn test_cyclic_rearms() {
        let mut wheel = TimerWheel::new(4);
        wheel.create(2, 2, TimerAction::TpdoEvent(0)).unwrap();
        assert_eq!(tick(&mut wheel, 6).len(), 3);
    }

    #[test]
    fn test_same_deadline_shares_event_slot() {
        let mut wheel = TimerWheel::new(4);
        wheel.create(5, 0, TimerAction::TpdoEvent(0)).unwrap();
        wheel.create(5, 0, TimerAction::TpdoEvent(1)).unwrap();
        // Two actions, one wheel node: a third distinct deadline still fits
        // even though only four event slots exist.
        wheel.create(7, 0, TimerAction::TpdoEvent(2)).unwrap();
        let fired = tick(&mut wheel, 5);
        assert_eq!(fired, [TimerAction::TpdoEvent(0), TimerAction::TpdoEvent(1)]);
        assert_eq!(tick(&mut wheel, 2), [TimerAction::TpdoEvent(2)]);
    }

    #[test]
    fn test_insert_before_pending_adjusts_delta() {
        let mut wheel = TimerWheel::new(4);
        wheel.create(10, 0, TimerAction::TpdoEvent(0)).unwrap();
        wheel.create(4, 0, TimerAction::TpdoEvent(1)).unwrap();
        assert_eq!(tick(&mut wheel, 4), [TimerAction::TpdoEvent(1)]);
        assert_eq!(tick(&mut wheel, 6), [TimerAction::TpdoEvent(0)]);
    }

    #[test]
    fn test_delete_prevents_firing() {
        let mut wheel = TimerWheel::new(4);
        let keep = wheel.create(3, 0, TimerAction::TpdoEvent(0)).unwrap();
        let drop = wheel.create(3, 0, TimerAction::TpdoEvent(1)).unwrap();
        wheel.delete(drop).unwrap();
        assert!(wheel.is_pending(keep));
        assert!(!wheel.is_pending(drop));
        assert_eq!(tick(&mut wheel, 3), [TimerAction::TpdoEvent(0)]);
    }

    #[test]
    fn test_delete_sole_action_merges_delta() {
        let mut wheel = TimerWheel::new(4);
        let first = wheel.create(3, 0, TimerAction::TpdoEvent(0)).unwrap();
        wheel.create(8, 0, TimerAction::TpdoEvent(1)).unwrap();
        wheel.delete(first).unwrap();
        assert!(tick(&mut wheel, 7).is_empty());
        assert_eq!(tick(&mut wheel, 1), [TimerAction::TpdoEvent(1)]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut wheel = TimerWheel::new(2);
        wheel.create(1, 0, TimerAction::Heartbeat).unwrap();
        wheel.create(2, 0, TimerAction::Heartbeat).unwrap();
        assert_eq!(
            wheel.create(3, 0, TimerAction::Heartbeat),
            Err(CanopenError::TimerExhausted)
        );
    }

    #[test]
    fn test_delete_unknown_handle() {
        let mut wheel = TimerWheel::new(2);
        let handle = wheel.create(1, 0, TimerAction::Heartbeat).unwrap();
        assert!(tick(&mut wheel, 1).len() == 1);
        assert_eq!(wheel.delete(handle), Err(CanopenError::TimerNotFound));
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut wheel = TimerWheel::new(2);
        wheel.create(5, 0, TimerAction::Heartbeat).unwrap();
        wheel.create(9, 0, TimerAction::TpdoEvent(0)).unwrap();
        wheel.clear();
        assert_eq!(wheel.free_slots(), 2);
        assert!(tick(&mut wheel, 20).is_empty());
    }
}
