// C4 — Transmission Scheduler (§4.4).
//
// Holds pending entries with deadlines, coalesces them into one datagram
// per (peer, expiry) via C3, and drives cyclic/repetition/one-shot timers
// off a single `TimerHeap` (§5's min-heap, owned here rather than by an
// external reactor — the reactor only needs to know when to call `tick`).
//
// Post-send callbacks are kept in a `slab::Slab` arena keyed by a small
// integer id rather than captured by reference, per the REDESIGN FLAGS
// ("store them as indices into an arena keyed by entry-id... avoids
// lifetime tangles entirely").

use slab::Slab;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::{TimerHeap, TimerId};
use crate::net::{PeerAddr, SdSocket};
use crate::sd::builder::EntrySpec;
use crate::sd::sender::ServiceDiscoverySender;
use crate::sd::wire::entry::EntryType;

/// Caller-assigned identity for one scheduled offer/subscribe-ack entry, so
/// it can later be found again by `unschedule_offer` or
/// `reject_all_acks_for_service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub u64);

/// A post-send action: an index into the scheduler's callback arena. Fired
/// once, after the datagram carrying its entry has been handed to the
/// sender (success or failure — §4.4 "Failure semantics").
pub type PostSendAction = Box<dyn FnOnce() + Send>;

struct PendingEntry {
    id: EntryId,
    spec: EntrySpec,
    post_send: Option<usize>,
}

/// One-shot timer, shared shape for both the multicast singleton and each
/// unicast destination's instance. Shorten-only: `expiry` only ever moves
/// earlier once armed (§3.3, §4.4).
struct OneShot {
    expiry: Instant,
    timer_id: Option<TimerId>,
    entries: Vec<PendingEntry>,
}

impl OneShot {
    fn new() -> Self {
        OneShot { expiry: Instant::now(), timer_id: None, entries: Vec::new() }
    }
}

struct CyclicTimer {
    timer_id: TimerId,
    next_fire: Instant,
    imminent: Vec<PendingEntry>,
    deferred: Vec<PendingEntry>,
}

/// §4.4: the repetition timer fires at `D, 2D, 4D, ..., (2^N-1)D` relative
/// to arming — i.e. each fire doubles the *timer's own* rearm delay, giving
/// absolute fire times `D, D+2D=3D, 3D+4D=7D, ...`, matching the worked
/// example in §8 directly. `cycle_count` is the 1-based count of fires so
/// far; an entry is dropped (and its `on_last_sent` invoked) once
/// `cycle_count` reaches the entry's own `max_repetitions`.
struct RepetitionTimer {
    base_delay: Duration,
    next_delay: Duration,
    timer_id: TimerId,
    cycle_count: u32,
    entries: Vec<RepetitionEntry>,
}

struct RepetitionEntry {
    pending: PendingEntry,
    max_repetitions: u32,
    on_last_sent: Option<usize>,
}

enum TimerKind {
    OneShotMulticast,
    OneShotUnicast(PeerAddr),
    Cyclic(Duration),
    Repetition(u64),
}

/// The C4 façade. Delegates actual datagram transmission to its
/// [`ServiceDiscoverySender`], which owns the session/reboot bookkeeping
/// (C2) and packing/codec pipeline (C3+C1).
pub struct Scheduler {
    timers: TimerHeap,
    timer_kinds: HashMap<TimerId, TimerKind>,
    one_shot_multicast: OneShot,
    one_shot_unicast: HashMap<PeerAddr, OneShot>,
    cyclic: HashMap<Duration, CyclicTimer>,
    repetition: HashMap<u64, RepetitionTimer>,
    post_send_actions: Slab<PostSendAction>,
    sender: ServiceDiscoverySender,
}

impl Scheduler {
    pub fn new(mtu: usize) -> Self {
        Scheduler {
            timers: TimerHeap::new(),
            timer_kinds: HashMap::new(),
            one_shot_multicast: OneShot::new(),
            one_shot_unicast: HashMap::new(),
            cyclic: HashMap::new(),
            repetition: HashMap::new(),
            post_send_actions: Slab::new(),
            sender: ServiceDiscoverySender::new(mtu),
        }
    }

    /// Relative duration until the next timer fires, for the reactor's
    /// `HandleEvents(timeout)` (§5). `None` means no timer is pending.
    pub fn next_expiry(&self, now: Instant) -> Option<Duration> {
        self.timers.get_next_expiry(now)
    }

    // ---- scheduling operations (§4.4) ----

    pub fn schedule_find(&mut self, id: EntryId, spec: EntrySpec, min_delay: Duration, max_delay: Duration, now: Instant) {
        self.arm_one_shot_multicast(id, spec, None, min_delay, max_delay, now);
    }

    pub fn schedule_offer_initial(
        &mut self,
        id: EntryId,
        spec: EntrySpec,
        min_delay: Duration,
        max_delay: Duration,
        now: Instant,
        on_sent: Option<PostSendAction>,
    ) {
        self.arm_one_shot_multicast(id, spec, on_sent, min_delay, max_delay, now);
    }

    /// Join or create the cyclic timer for `period`. A freshly added offer
    /// lands in `deferred` (sent next cycle), unless the next fire is more
    /// than half a period away, in which case it joins `imminent` (§4.4
    /// `check_send_current_cycle`).
    pub fn schedule_offer_cyclic(&mut self, id: EntryId, spec: EntrySpec, period: Duration, now: Instant) {
        let entry = PendingEntry { id, spec, post_send: None };
        if let Some(cyc) = self.cyclic.get_mut(&period) {
            let remaining = cyc.next_fire.saturating_duration_since(now);
            if remaining >= period / 2 {
                cyc.imminent.push(entry);
            } else {
                cyc.deferred.push(entry);
            }
            return;
        }
        let next_fire = now + period;
        let timer_id = self.timers.arm(next_fire);
        self.timer_kinds.insert(timer_id, TimerKind::Cyclic(period));
        self.cyclic.insert(
            period,
            CyclicTimer { timer_id, next_fire, imminent: vec![entry], deferred: Vec::new() },
        );
    }

    /// Join or create the repetition schedule identified by `repetition_id`
    /// (one per provided instance in the Repetition phase). Fires at
    /// `D, 3D, 7D, ..., (2^N-1)D` relative to the schedule's creation; see
    /// [`RepetitionTimer`] for how that maps onto `cycle_count`.
    pub fn schedule_offer_repetition(
        &mut self,
        repetition_id: u64,
        id: EntryId,
        spec: EntrySpec,
        base_delay: Duration,
        max_repetitions: u32,
        now: Instant,
        on_last_sent: Option<PostSendAction>,
    ) {
        let on_last_sent_idx = on_last_sent.map(|cb| self.post_send_actions.insert(cb));
        let rep_entry = RepetitionEntry {
            pending: PendingEntry { id, spec, post_send: None },
            max_repetitions,
            on_last_sent: on_last_sent_idx,
        };
        if let Some(rep) = self.repetition.get_mut(&repetition_id) {
            rep.entries.push(rep_entry);
            return;
        }
        let timer_id = self.timers.arm(now + base_delay);
        self.timer_kinds.insert(timer_id, TimerKind::Repetition(repetition_id));
        self.repetition.insert(
            repetition_id,
            RepetitionTimer {
                base_delay,
                next_delay: base_delay,
                timer_id,
                cycle_count: 0,
                entries: vec![rep_entry],
            },
        );
    }

    pub fn schedule_offer_unicast(&mut self, id: EntryId, spec: EntrySpec, min_delay: Duration, max_delay: Duration, to: PeerAddr, now: Instant) {
        self.arm_one_shot_unicast(id, spec, None, min_delay, max_delay, to, now);
    }

    pub fn schedule_subscribe_eventgroup(&mut self, id: EntryId, spec: EntrySpec, min_delay: Duration, max_delay: Duration, to: PeerAddr, now: Instant) {
        self.arm_one_shot_unicast(id, spec, None, min_delay, max_delay, to, now);
    }

    pub fn schedule_subscribe_ack(
        &mut self,
        id: EntryId,
        spec: EntrySpec,
        min_delay: Duration,
        max_delay: Duration,
        to: PeerAddr,
        now: Instant,
        on_sent: Option<PostSendAction>,
    ) {
        self.arm_one_shot_unicast(id, spec, on_sent, min_delay, max_delay, to, now);
    }

    pub fn schedule_subscribe_nack(&mut self, id: EntryId, mut spec: EntrySpec, to: PeerAddr, now: Instant) {
        spec.ttl = 0;
        self.arm_one_shot_unicast(id, spec, None, Duration::ZERO, Duration::ZERO, to, now);
    }

    pub fn schedule_stop_offer(&mut self, id: EntryId, mut spec: EntrySpec, now: Instant) {
        spec.ttl = 0;
        self.arm_one_shot_multicast(id, spec, None, Duration::ZERO, Duration::ZERO, now);
    }

    pub fn schedule_stop_subscribe(&mut self, id: EntryId, mut spec: EntrySpec, to: PeerAddr, now: Instant) {
        spec.ttl = 0;
        self.arm_one_shot_unicast(id, spec, None, Duration::ZERO, Duration::ZERO, to, now);
    }

    /// Remove `entry_id` from the cyclic timer for `period` (if given) or
    /// from every cyclic/repetition timer otherwise.
    pub fn unschedule_offer(&mut self, entry_id: EntryId, period: Option<Duration>) {
        if let Some(period) = period {
            if let Some(cyc) = self.cyclic.get_mut(&period) {
                cyc.imminent.retain(|e| e.id != entry_id);
                cyc.deferred.retain(|e| e.id != entry_id);
            }
        } else {
            for cyc in self.cyclic.values_mut() {
                cyc.imminent.retain(|e| e.id != entry_id);
                cyc.deferred.retain(|e| e.id != entry_id);
            }
        }
        for rep in self.repetition.values_mut() {
            rep.entries.retain(|e| e.pending.id != entry_id);
        }
        self.one_shot_multicast.entries.retain(|e| e.id != entry_id);
        for oneshot in self.one_shot_unicast.values_mut() {
            oneshot.entries.retain(|e| e.id != entry_id);
        }
    }

    /// Convert pending Acks into Nacks for a given service, by clearing
    /// their TTL in place (TTL=0 on an Ack entry is the Nack encoding).
    pub fn reject_all_acks_for_service(&mut self, service_id: u16, instance_id: u16) {
        for oneshot in self.one_shot_unicast.values_mut() {
            for entry in &mut oneshot.entries {
                if entry.spec.entry_type == EntryType::SubscribeEventgroupAck
                    && entry.spec.service_id == service_id
                    && entry.spec.instance_id == instance_id
                {
                    entry.spec.ttl = 0;
                }
            }
        }
    }

    /// Arm (or shorten) the one-shot multicast singleton. Per §3.3/§4.4,
    /// once armed a one-shot timer may only be shortened, never extended:
    /// a later `requested_expiry` than the one already armed is ignored,
    /// and the entry simply joins the existing batch.
    fn arm_one_shot_multicast(
        &mut self,
        id: EntryId,
        spec: EntrySpec,
        on_sent: Option<PostSendAction>,
        min_delay: Duration,
        max_delay: Duration,
        now: Instant,
    ) {
        let post_send = on_sent.map(|cb| self.post_send_actions.insert(cb));
        let requested_expiry = now + max_delay.max(min_delay);
        let one_shot = &mut self.one_shot_multicast;
        let already_armed = one_shot.timer_id.is_some();
        let shortened = !already_armed || requested_expiry < one_shot.expiry;
        if shortened {
            one_shot.expiry = requested_expiry;
        }
        one_shot.entries.push(PendingEntry { id, spec, post_send });
        if shortened {
            let timer_id = self.timers.arm(one_shot.expiry);
            self.timer_kinds.insert(timer_id, TimerKind::OneShotMulticast);
            self.one_shot_multicast.timer_id = Some(timer_id);
        }
    }

    /// Same shorten-only semantics as [`Scheduler::arm_one_shot_multicast`],
    /// keyed per destination (§3.3).
    fn arm_one_shot_unicast(
        &mut self,
        id: EntryId,
        spec: EntrySpec,
        on_sent: Option<PostSendAction>,
        min_delay: Duration,
        max_delay: Duration,
        to: PeerAddr,
        now: Instant,
    ) {
        let post_send = on_sent.map(|cb| self.post_send_actions.insert(cb));
        let requested_expiry = now + max_delay.max(min_delay);
        let existed = self.one_shot_unicast.contains_key(&to);
        let one_shot = self.one_shot_unicast.entry(to).or_insert_with(OneShot::new);
        let shortened = !existed || requested_expiry < one_shot.expiry;
        if shortened {
            one_shot.expiry = requested_expiry;
        }
        one_shot.entries.push(PendingEntry { id, spec, post_send });
        if shortened {
            let timer_id = self.timers.arm(one_shot.expiry);
            self.timer_kinds.insert(timer_id, TimerKind::OneShotUnicast(to));
            one_shot.timer_id = Some(timer_id);
        }
    }

    // ---- timer service loop ----

    /// Drive every timer due at or before `now`, sending datagrams via
    /// `socket` and running post-send callbacks afterward.
    ///
    /// Shortening a one-shot timer arms a fresh heap entry without removing
    /// the one it superseded (`TimerHeap` has no by-id removal); a popped
    /// id that no longer matches the one-shot's `timer_id` is a stale
    /// leftover from before the shortening and is silently ignored.
    pub fn tick(&mut self, now: Instant, socket: &dyn SdSocket) {
        let due = self.timers.pop_due(now);
        for timer_id in due {
            let Some(kind) = self.timer_kinds.remove(&timer_id) else { continue };
            match kind {
                TimerKind::OneShotMulticast => {
                    if self.one_shot_multicast.timer_id == Some(timer_id) {
                        self.fire_one_shot_multicast(socket);
                    }
                }
                TimerKind::OneShotUnicast(peer) => {
                    if self.one_shot_unicast.get(&peer).and_then(|o| o.timer_id) == Some(timer_id) {
                        self.fire_one_shot_unicast(peer, socket);
                    }
                }
                TimerKind::Cyclic(period) => self.fire_cyclic(period, now, socket),
                TimerKind::Repetition(rep_id) => self.fire_repetition(rep_id, now, socket),
            }
        }
    }

    fn send_specs(&mut self, socket: &dyn SdSocket, entries: Vec<PendingEntry>, to: Option<PeerAddr>) {
        if entries.is_empty() {
            return;
        }
        let specs = entries.iter().map(|e| e.spec.clone()).collect();
        match to {
            Some(peer) => self.sender.send_unicast(specs, peer, socket),
            None => self.sender.send_multicast(specs, socket),
        };
        for entry in entries {
            if let Some(idx) = entry.post_send {
                if self.post_send_actions.contains(idx) {
                    let cb = self.post_send_actions.remove(idx);
                    cb();
                }
            }
        }
    }

    fn fire_one_shot_multicast(&mut self, socket: &dyn SdSocket) {
        let entries = std::mem::take(&mut self.one_shot_multicast.entries);
        self.one_shot_multicast.timer_id = None;
        self.send_specs(socket, entries, None);
    }

    fn fire_one_shot_unicast(&mut self, peer: PeerAddr, socket: &dyn SdSocket) {
        if let Some(mut one_shot) = self.one_shot_unicast.remove(&peer) {
            let entries = std::mem::take(&mut one_shot.entries);
            self.send_specs(socket, entries, Some(peer));
        }
    }

    fn fire_cyclic(&mut self, period: Duration, now: Instant, socket: &dyn SdSocket) {
        let Some(cyc) = self.cyclic.get_mut(&period) else { return };
        let imminent = std::mem::replace(&mut cyc.imminent, std::mem::take(&mut cyc.deferred));
        let next_fire = now + period;
        let new_timer_id = self.timers.arm(next_fire);
        cyc.timer_id = new_timer_id;
        cyc.next_fire = next_fire;
        self.timer_kinds.insert(new_timer_id, TimerKind::Cyclic(period));
        self.send_specs(socket, imminent, None);
    }

    /// Every entry in the schedule fires together on every tick; an entry
    /// whose `max_repetitions` the new `cycle_count` reaches is sent one
    /// last time, its `on_last_sent` callback queued, then dropped. The
    /// timer's own rearm delay doubles each fire (`D -> 2D -> 4D -> ...`),
    /// producing absolute fire times `D, 3D, 7D, ..., (2^N-1)D`.
    fn fire_repetition(&mut self, repetition_id: u64, now: Instant, socket: &dyn SdSocket) {
        let Some(rep) = self.repetition.get_mut(&repetition_id) else { return };
        rep.cycle_count += 1;
        let cycle_count = rep.cycle_count;

        let mut due_now = Vec::new();
        let mut finished_callbacks = Vec::new();
        rep.entries.retain_mut(|e| {
            due_now.push(e.pending.spec.clone());
            if cycle_count >= e.max_repetitions {
                if let Some(idx) = e.on_last_sent.take() {
                    finished_callbacks.push(idx);
                }
                false
            } else {
                true
            }
        });

        let still_pending = !rep.entries.is_empty();
        if still_pending {
            rep.next_delay *= 2;
            let timer_id = self.timers.arm(now + rep.next_delay);
            rep.timer_id = timer_id;
            self.timer_kinds.insert(timer_id, TimerKind::Repetition(repetition_id));
        } else {
            self.repetition.remove(&repetition_id);
        }

        let specs_as_entries: Vec<PendingEntry> = due_now
            .into_iter()
            .map(|spec| PendingEntry { id: EntryId(0), spec, post_send: None })
            .collect();
        self.send_specs(socket, specs_as_entries, None);
        for idx in finished_callbacks {
            if self.post_send_actions.contains(idx) {
                let cb = self.post_send_actions.remove(idx);
                cb();
            }
        }
    }
}
