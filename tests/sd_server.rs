// Full-lifecycle integration of the server SD state machine (C5) driving
// the transmission scheduler (C4) and sender (C1-C3) together, the way a
// single reactor thread would (§5): advance a clock, tick the scheduler,
// feed back what actually went out on the wire as state-machine events.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use someip_sd_core::config::OfferTiming;
use someip_sd_core::net::{PeerAddr, SdSocket};
use someip_sd_core::sd::scheduler::Scheduler;
use someip_sd_core::sd::server::{Server, ServerConfig, ServerEvent, ServerState};
use someip_sd_core::sd::wire::codec::decode_sd_message;
use someip_sd_core::sd::wire::option::{Protocol, SdOption};

#[derive(Default)]
struct RecordingSocket {
    unicast: Mutex<Vec<(PeerAddr, Vec<u8>)>>,
    multicast: Mutex<Vec<Vec<u8>>>,
}

impl SdSocket for RecordingSocket {
    fn send_unicast(&self, to: PeerAddr, bytes: &[u8]) -> bool {
        self.unicast.lock().unwrap().push((to, bytes.to_vec()));
        true
    }
    fn send_multicast(&self, bytes: &[u8]) -> bool {
        self.multicast.lock().unwrap().push(bytes.to_vec());
        true
    }
}

fn timing() -> OfferTiming {
    OfferTiming {
        initial_delay_min: Duration::from_millis(10),
        initial_delay_max: Duration::from_millis(10),
        repetition_base_delay: Duration::from_millis(100),
        repetition_max: 3,
        cyclic_offer_delay: Duration::from_millis(1000),
        request_response_delay_min: Duration::from_millis(5),
        request_response_delay_max: Duration::from_millis(20),
    }
}

fn make_server_with(timing: OfferTiming) -> Server {
    let cfg = ServerConfig {
        service_id: 0x1234,
        instance_id: 0x0001,
        major_version: 0x01,
        minor_version: 7,
        endpoint: SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 0, 2, 10),
            port: 30509,
            proto: Protocol::Udp,
            multicast: false,
        },
        timing,
    };
    Server::new(cfg, 1)
}

fn make_server() -> Server {
    make_server_with(timing())
}

/// Drive the server from `Down` all the way into steady-state `Main`,
/// bringing the scheduler and a recording socket along for the ride.
fn bring_up(server: &mut Server, scheduler: &mut Scheduler, socket: &RecordingSocket, start: Instant, t: OfferTiming) -> Instant {
    let mut now = start;
    server.handle_event(ServerEvent::NetworkUp, now, scheduler);
    server.handle_event(ServerEvent::ServiceUp, now, scheduler);
    assert_eq!(server.state(), ServerState::InitialWait);

    now += t.initial_delay_max + Duration::from_millis(1);
    scheduler.tick(now, socket);
    assert_eq!(socket.multicast.lock().unwrap().len(), 1, "initial offer should have gone out");
    server.handle_event(ServerEvent::OfferSent, now, scheduler);
    assert_eq!(server.state(), ServerState::Repetition);

    // Repetition fires at +1D, +3D, +7D relative to entering Repetition.
    let base = t.repetition_base_delay;
    for mult in [1u32, 3, 7] {
        now = start + t.initial_delay_max + Duration::from_millis(1) + base * mult;
        scheduler.tick(now, socket);
    }
    assert_eq!(socket.multicast.lock().unwrap().len(), 4, "1 initial + 3 repetitions");
    server.handle_event(ServerEvent::RepetitionDone, now, scheduler);
    assert_eq!(server.state(), ServerState::Main);
    now
}

#[test]
fn full_lifecycle_reaches_main_and_offers_cyclically() {
    let socket = RecordingSocket::default();
    let mut scheduler = Scheduler::new(1416);
    let mut server = make_server();
    let start = Instant::now();
    let mut now = bring_up(&mut server, &mut scheduler, &socket, start, timing());

    let before = socket.multicast.lock().unwrap().len();
    now += timing().cyclic_offer_delay;
    scheduler.tick(now, &socket);
    let after = socket.multicast.lock().unwrap().len();
    assert_eq!(after, before + 1, "cyclic offer should fire exactly once per period");

    let sent = socket.multicast.lock().unwrap().last().unwrap().clone();
    let decoded = decode_sd_message(&sent).unwrap();
    assert_eq!(decoded.entries[0].service_id, 0x1234);
    assert!(decoded.entries[0].ttl > 0);
}

#[test]
fn service_down_from_main_broadcasts_stop_offer() {
    let socket = RecordingSocket::default();
    let mut scheduler = Scheduler::new(1416);
    let mut server = make_server();
    let start = Instant::now();
    let now = bring_up(&mut server, &mut scheduler, &socket, start, timing());

    server.handle_event(ServerEvent::ServiceDown, now, &mut scheduler);
    assert_eq!(server.state(), ServerState::Down);
    scheduler.tick(now, &socket);

    let sent = socket.multicast.lock().unwrap();
    let last = decode_sd_message(sent.last().unwrap()).unwrap();
    assert!(last.entries[0].is_stop(), "leaving Main via ServiceDown must emit a StopOffer (TTL=0)");
}

#[test]
fn find_received_during_repetition_gets_a_prompt_unicast_reply() {
    let socket = RecordingSocket::default();
    let mut scheduler = Scheduler::new(1416);
    let mut server = make_server();
    let start = Instant::now();

    server.handle_event(ServerEvent::NetworkUp, start, &mut scheduler);
    server.handle_event(ServerEvent::ServiceUp, start, &mut scheduler);
    let now = start + timing().initial_delay_max + Duration::from_millis(1);
    scheduler.tick(now, &socket);
    server.handle_event(ServerEvent::OfferSent, now, &mut scheduler);
    assert_eq!(server.state(), ServerState::Repetition);

    let peer = PeerAddr::v4(Ipv4Addr::new(192, 0, 2, 50), 45000);
    server.handle_event(ServerEvent::FindReceived { from: peer }, now, &mut scheduler);
    let reply_at = now + timing().request_response_delay_max + Duration::from_millis(1);
    scheduler.tick(reply_at, &socket);

    let unicast = socket.unicast.lock().unwrap();
    assert_eq!(unicast.len(), 1);
    assert_eq!(unicast[0].0, peer);
}

#[test]
fn find_received_during_main_coalesces_into_next_cyclic_offer() {
    // §4.5's Main row only coalesces when `request_response_delay_max` is at
    // least half the cyclic period; pick timing where that holds, unlike
    // the other scenarios in this file which want a prompt unicast instead.
    let mut t = timing();
    t.cyclic_offer_delay = Duration::from_millis(40);
    t.request_response_delay_max = Duration::from_millis(20);

    let socket = RecordingSocket::default();
    let mut scheduler = Scheduler::new(1416);
    let mut server = make_server_with(t);
    let start = Instant::now();
    let now = bring_up(&mut server, &mut scheduler, &socket, start, t);

    let peer = PeerAddr::v4(Ipv4Addr::new(192, 0, 2, 51), 45000);
    server.handle_event(ServerEvent::FindReceived { from: peer }, now, &mut scheduler);

    // request_response_delay_max has elapsed with no dedicated unicast reply:
    // Main coalesces Finds into the cyclic cycle instead.
    let past_rrd = now + t.request_response_delay_max + Duration::from_millis(1);
    scheduler.tick(past_rrd, &socket);
    assert!(socket.unicast.lock().unwrap().is_empty());

    let next_cycle = now + t.cyclic_offer_delay;
    scheduler.tick(next_cycle, &socket);
    assert!(!socket.multicast.lock().unwrap().is_empty());
}
