// C5 — Server SD State Machine (§4.5).
//
// One instance per provided service instance. States are a plain enum
// dispatched in a single `update_state` function rather than the virtual
// dispatch of the original design (§9 "Cyclic ownership / virtual dispatch
// in C5"): no heap, no vtable, transitions stay total and checkable.
//
// Event handlers call `request_state_change`; the owner calls
// `update_state()` afterward, which validates, runs `on_leave`, swaps, runs
// `on_enter`. This keeps callback-initiated transitions from re-entering
// the state machine mid-transition (§4.5 "State-change request pattern").

use crate::config::OfferTiming;
use crate::net::PeerAddr;
use crate::sd::builder::EntrySpec;
use crate::sd::scheduler::{EntryId, Scheduler};
use crate::sd::wire::entry::{EntryTail, EntryType};
use crate::sd::wire::option::SdOption;
use crate::sd::wire::primitives::{INSTANCE_ID_ANY, MAJOR_VERSION_ANY, MINOR_VERSION_ANY, TTL_FOREVER};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Down,
    InitialWait,
    Repetition,
    Main,
}

/// External inputs to the state machine (§3.4, §4.5).
pub enum ServerEvent {
    ServiceUp,
    ServiceDown,
    NetworkUp,
    NetworkDown,
    /// A Find matching this instance arrived from `from`. Matching itself
    /// (§4.5 "FindReceived matching") happens before this event is raised;
    /// see [`find_matches`].
    FindReceived { from: PeerAddr },
    /// Timer feedback: the scheduled initial Offer was actually sent.
    OfferSent,
    /// Timer feedback: the repetition schedule reached its last cycle.
    RepetitionDone,
}

/// Static identity and timing for one provided service instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    pub endpoint: SdOption,
    pub timing: OfferTiming,
}

/// §4.5 "FindReceived matching": `ServiceId` matches exactly; `InstanceId`,
/// `MajorVersion`, `MinorVersion` match exactly or carry their "any"
/// sentinel.
pub fn find_matches(cfg: &ServerConfig, find_instance: u16, find_major: u8, find_minor: u32) -> bool {
    (find_instance == INSTANCE_ID_ANY || find_instance == cfg.instance_id)
        && (find_major == MAJOR_VERSION_ANY || find_major == cfg.major_version)
        && (find_minor == MINOR_VERSION_ANY || find_minor == cfg.minor_version)
}

/// Per-instance identifiers handed to the scheduler; kept stable across the
/// instance's lifetime so `unschedule_offer`/`reject_all_acks_for_service`
/// can find this instance's own pending work.
struct SchedulingIdentity {
    cyclic_entry_id: Option<EntryId>,
    initial_entry_id: Option<EntryId>,
    repetition_stream_id: u64,
    next_entry_id: u64,
}

impl SchedulingIdentity {
    fn fresh_id(&mut self) -> EntryId {
        self.next_entry_id += 1;
        EntryId(self.next_entry_id)
    }
}

/// The C5 state machine for one provided service instance.
pub struct Server {
    config: ServerConfig,
    state: ServerState,
    pending_transition: Option<ServerState>,
    service_up: bool,
    network_up: bool,
    pending_finds: Vec<PeerAddr>,
    ids: SchedulingIdentity,
}

impl Server {
    pub fn new(config: ServerConfig, repetition_stream_id: u64) -> Self {
        Server {
            config,
            state: ServerState::Down,
            pending_transition: None,
            service_up: false,
            network_up: false,
            pending_finds: Vec::new(),
            ids: SchedulingIdentity {
                cyclic_entry_id: None,
                initial_entry_id: None,
                repetition_stream_id,
                next_entry_id: 0,
            },
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn request_state_change(&mut self, to: ServerState) {
        self.pending_transition = Some(to);
    }

    /// Handle one external event, then apply any requested transition.
    pub fn handle_event(&mut self, event: ServerEvent, now: Instant, scheduler: &mut Scheduler) {
        match (&self.state, event) {
            (ServerState::Down, ServerEvent::ServiceUp) => {
                self.service_up = true;
                if self.network_up {
                    self.request_state_change(ServerState::InitialWait);
                }
            }
            (ServerState::Down, ServerEvent::NetworkUp) => {
                self.network_up = true;
                if self.service_up {
                    self.request_state_change(ServerState::InitialWait);
                }
            }
            (ServerState::Down, _) => {}

            (ServerState::InitialWait, ServerEvent::ServiceDown) => {
                self.service_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::InitialWait, ServerEvent::NetworkDown) => {
                self.network_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::InitialWait, ServerEvent::OfferSent) => {
                self.request_state_change(ServerState::Repetition);
            }
            (ServerState::InitialWait, ServerEvent::FindReceived { from }) => {
                self.pending_finds.push(from);
            }
            (ServerState::InitialWait, _) => {}

            (ServerState::Repetition, ServerEvent::ServiceDown) => {
                self.service_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::Repetition, ServerEvent::NetworkDown) => {
                self.network_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::Repetition, ServerEvent::RepetitionDone) => {
                self.request_state_change(ServerState::Main);
            }
            (ServerState::Repetition, ServerEvent::FindReceived { from }) => {
                self.reply_to_find(from, now, scheduler);
            }
            (ServerState::Repetition, _) => {}

            (ServerState::Main, ServerEvent::ServiceDown) => {
                self.service_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::Main, ServerEvent::NetworkDown) => {
                self.network_up = false;
                self.request_state_change(ServerState::Down);
            }
            (ServerState::Main, ServerEvent::FindReceived { from }) => {
                self.reply_to_find(from, now, scheduler);
            }
            (ServerState::Main, _) => {}
        }
        self.update_state(now, scheduler);
    }

    fn update_state(&mut self, now: Instant, scheduler: &mut Scheduler) {
        let Some(to) = self.pending_transition.take() else { return };
        if to == self.state {
            return;
        }
        let from = self.state;
        self.on_leave(from, now, scheduler);
        self.state = to;
        self.on_enter(to, from, now, scheduler);
    }

    fn on_leave(&mut self, from: ServerState, now: Instant, scheduler: &mut Scheduler) {
        match from {
            ServerState::InitialWait => {
                if let Some(id) = self.ids.initial_entry_id.take() {
                    scheduler.unschedule_offer(id, None);
                }
            }
            ServerState::Repetition => {
                if let Some(id) = self.ids.cyclic_entry_id.take() {
                    scheduler.unschedule_offer(id, None);
                }
                scheduler.reject_all_acks_for_service(self.config.service_id, self.config.instance_id);
            }
            ServerState::Main => {
                if let Some(id) = self.ids.cyclic_entry_id.take() {
                    scheduler.unschedule_offer(id, Some(self.config.timing.cyclic_offer_delay));
                }
            }
            ServerState::Down => {}
        }
        let _ = (now, scheduler);
    }

    fn on_enter(&mut self, to: ServerState, from: ServerState, now: Instant, scheduler: &mut Scheduler) {
        match to {
            ServerState::Down => {
                // Only Repetition/Main ever actually sent an Offer; a
                // down-transition straight out of InitialWait never emitted
                // one (it was unscheduled in on_leave), so there is nothing
                // to cancel with a multicast StopOffer.
                if matches!(from, ServerState::Repetition | ServerState::Main) {
                    let spec = self.offer_spec(TTL_FOREVER);
                    let mut stop = spec;
                    stop.ttl = 0;
                    let id = self.ids.fresh_id();
                    scheduler.schedule_stop_offer(id, stop, now);
                }
            }
            ServerState::InitialWait => {
                let spec = self.offer_spec(TTL_FOREVER);
                let id = self.ids.fresh_id();
                self.ids.initial_entry_id = Some(id);
                scheduler.schedule_offer_initial(
                    id,
                    spec,
                    self.config.timing.initial_delay_min,
                    self.config.timing.initial_delay_max,
                    now,
                    None,
                );
            }
            ServerState::Repetition => {
                let spec = self.offer_spec(TTL_FOREVER);
                let id = self.ids.fresh_id();
                scheduler.schedule_offer_repetition(
                    self.ids.repetition_stream_id,
                    id,
                    spec,
                    self.config.timing.repetition_base_delay,
                    self.config.timing.repetition_max,
                    now,
                    None,
                );
                for finder in std::mem::take(&mut self.pending_finds) {
                    self.reply_to_find(finder, now, scheduler);
                }
            }
            ServerState::Main => {
                let spec = self.offer_spec(TTL_FOREVER);
                let id = self.ids.fresh_id();
                self.ids.cyclic_entry_id = Some(id);
                scheduler.schedule_offer_cyclic(id, spec, self.config.timing.cyclic_offer_delay, now);
            }
        }
    }

    fn reply_to_find(&mut self, from: PeerAddr, now: Instant, scheduler: &mut Scheduler) {
        let period = self.config.timing.cyclic_offer_delay;
        let rrd_max = self.config.timing.request_response_delay_max;
        if self.state == ServerState::Main && rrd_max >= period / 2 {
            // Coalesce into the next multicast cycle instead of a dedicated
            // unicast reply (§4.5 Main row).
            return;
        }
        let spec = self.offer_spec(TTL_FOREVER);
        let id = self.ids.fresh_id();
        scheduler.schedule_offer_unicast(
            id,
            spec,
            self.config.timing.request_response_delay_min,
            rrd_max,
            from,
            now,
        );
    }

    fn offer_spec(&self, ttl: u32) -> EntrySpec {
        EntrySpec {
            entry_type: EntryType::OfferService,
            service_id: self.config.service_id,
            instance_id: self.config.instance_id,
            major_version: self.config.major_version,
            ttl,
            tail: EntryTail::MinorVersion(self.config.minor_version),
            options: vec![self.config.endpoint],
        }
    }
}
