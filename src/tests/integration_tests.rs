//! End-to-end tests running the event loop against real sockets
//!
//! Peers run on plain threads with blocking std sockets while the test
//! thread drives `listen_forever`.

use super::test_utils::{attach_mock, init_logging, watchdog, Event, FaultLog, MockTransport, Recorder, TEST_DEADLINE};
use crate::{
    Config, Connection, Context, DataSource, DoneFlag, Error, Handler, HandlerResult, RawServer, SocketKind,
    WeakRawServer, WriteStrategy,
};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

fn server(config: Config) -> RawServer {
    init_logging();
    RawServer::new(config).expect("runtime")
}

/// Drive the loop until `done` is set, or fail the test by timing out.
fn run(server: &RawServer, done: &DoneFlag) {
    watchdog(done, TEST_DEADLINE);
    let started = Instant::now();
    server.listen_forever(done.clone());
    assert!(started.elapsed() < TEST_DEADLINE, "event loop hit the test deadline");
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
    stream
}

fn echo_round_trip(strategy: WriteStrategy) {
    let server = server(Config::default().with_write_strategy(strategy));
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    let recorder = Recorder::echoing();
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&socket, recorder.clone(), None));

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        stream.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        reply
    });
    run(&server, &done);

    assert_eq!(&peer.join().unwrap(), b"ping");
    assert_eq!(recorder.received(), b"ping");
    let lifecycle = recorder.lifecycle();
    assert_eq!(lifecycle.first(), Some(&Event::Made));
    assert_eq!(lifecycle.last(), Some(&Event::Lost));
    assert_eq!(recorder.count(&Event::Lost), 1);
    assert!(recorder.count(&Event::Flushed) >= 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_tcp_echo_pull() {
    echo_round_trip(WriteStrategy::Pull);
}

#[test]
fn test_tcp_echo_push() {
    echo_round_trip(WriteStrategy::Push);
}

#[test]
fn test_outbound_connection() {
    let server = server(Config::default());
    let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).unwrap();
        stream.write_all(b"pong").unwrap();
        request
    });

    let done = DoneFlag::new();
    let recorder = Recorder::greeting(b"ping");
    recorder.finish_with(&done);
    let conn = assert_ok!(server.start_connection(("127.0.0.1", addr.port()), recorder.clone(), None, false))
        .expect("admitted");
    assert!(server.handle().is_pending(LOCALHOST));
    run(&server, &done);

    assert_eq!(&peer.join().unwrap(), b"ping");
    assert_eq!(recorder.received(), b"pong");
    assert_eq!(recorder.lifecycle().first(), Some(&Event::Made));
    assert_eq!(recorder.count(&Event::Lost), 1);
    assert!(server.pending_connections().is_empty());
    assert!(!conn.is_established());
}

#[test]
fn test_connection_refused() {
    let server = server(Config::default());
    let addr = {
        let probe = TcpListener::bind((LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap()
    };

    let done = DoneFlag::new();
    let recorder = Recorder::new();
    recorder.finish_with(&done);
    assert_ok!(server.start_connection(("127.0.0.1", addr.port()), recorder.clone(), None, false));
    run(&server, &done);

    assert_eq!(
        recorder.events(),
        vec![Event::Failed(Error::ConnectionRefused(addr).to_string())]
    );
    assert!(server.pending_connections().is_empty());
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_close_while_pending() {
    let server = server(Config::default());
    let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let recorder = Recorder::new();
    let conn = assert_ok!(server.start_connection(("127.0.0.1", port), recorder.clone(), None, false))
        .expect("admitted");
    assert_ok!(conn.close());

    let done = DoneFlag::new();
    let finish = done.clone();
    server.add_task(Duration::from_millis(200), move || finish.set());
    run(&server, &done);

    assert_eq!(
        recorder.events(),
        vec![Event::Failed(Error::ClosedBeforeEstablished.to_string())]
    );
    assert_eq!(server.connection_count(), 0);
    assert!(server.pending_connections().is_empty());
}

#[test]
fn test_idle_timeout_drops_silent_peer() {
    let server = server(Config::default().with_socket_timeout(Duration::from_millis(300)));
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    let recorder = Recorder::new();
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&socket, recorder.clone(), None));

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).is_ok()
    });
    run(&server, &done);

    assert!(peer.join().unwrap(), "peer should see an orderly close");
    assert_eq!(recorder.events(), vec![Event::Made, Event::Lost]);
    let made = recorder.time_of(|e| *e == Event::Made).unwrap();
    let lost = recorder.time_of(|e| *e == Event::Lost).unwrap();
    assert!(lost - made >= Duration::from_millis(290));
}

#[test]
fn test_idle_timeout_reset_by_traffic() {
    let server = server(Config::default().with_socket_timeout(Duration::from_millis(400)));
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    let recorder = Recorder::new();
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&socket, recorder.clone(), None));

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        thread::sleep(Duration::from_millis(250));
        stream.write_all(b"a").unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });
    run(&server, &done);
    peer.join().unwrap();

    let made = recorder.time_of(|e| *e == Event::Made).unwrap();
    let data = recorder.time_of(|e| matches!(e, Event::Data(_))).unwrap();
    let lost = recorder.time_of(|e| *e == Event::Lost).unwrap();
    assert!(lost - data >= Duration::from_millis(380));
    assert!(lost - made >= Duration::from_millis(550));
}

/// Fails in every way a handler can, and still expects its final callback.
struct Faulty {
    lost: Cell<u32>,
    done: DoneFlag,
}

impl Handler for Faulty {
    fn connection_made(&self, _conn: &Connection) -> HandlerResult {
        panic!("cannot handle new connections");
    }

    fn data_came_in(&self, _source: DataSource<'_>, _data: &[u8]) -> HandlerResult {
        Err("malformed message".into())
    }

    fn connection_lost(&self, _conn: &Connection) -> HandlerResult {
        self.lost.set(self.lost.get() + 1);
        self.done.set();
        Ok(())
    }
}

fn faulty_session(config: Config, context: Option<Rc<dyn Context>>) -> Rc<Faulty> {
    let server = server(config);
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    let handler = Rc::new(Faulty {
        lost: Cell::new(0),
        done: done.clone(),
    });
    assert_ok!(server.start_listening(&socket, handler.clone(), context));

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        stream.write_all(b"x").unwrap();
    });
    run(&server, &done);
    peer.join().unwrap();
    handler
}

#[test]
fn test_handler_faults_go_to_context() {
    let faults = FaultLog::new();
    let handler = faulty_session(Config::default(), Some(faults.clone() as Rc<dyn Context>));

    assert_eq!(faults.faults(), vec![("connection_made", true), ("data_came_in", false)]);
    assert_eq!(handler.lost.get(), 1);
}

#[test]
fn test_handler_faults_without_context() {
    let handler = faulty_session(Config::default().with_noisy(false), None);
    assert_eq!(handler.lost.get(), 1);
}

#[test]
fn test_faulty_handler_does_not_disturb_other_connections() {
    let server = server(Config::default());
    let faulty_socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let faulty_addr = faulty_socket.local_addr().expect("bound");
    let healthy_socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let healthy_addr = healthy_socket.local_addr().expect("bound");

    let done = DoneFlag::new();
    let faults = FaultLog::new();
    let faulty = Rc::new(Faulty {
        lost: Cell::new(0),
        done: DoneFlag::new(),
    });
    let recorder = Recorder::replying(b"pong");
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&faulty_socket, faulty, Some(faults.clone() as Rc<dyn Context>)));
    assert_ok!(server.start_listening(&healthy_socket, recorder.clone(), None));

    let noisy = thread::spawn(move || {
        let mut stream = connect(faulty_addr);
        for _ in 0..10 {
            let _ = stream.write_all(b"x");
            thread::sleep(Duration::from_millis(20));
        }
    });
    let peer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let mut stream = connect(healthy_addr);
        stream.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        reply
    });
    run(&server, &done);
    noisy.join().unwrap();

    assert_eq!(&peer.join().unwrap(), b"pong");
    assert_eq!(recorder.received(), b"ping");
    assert_eq!(recorder.count(&Event::Lost), 1);
    assert!(faults.faults().contains(&("data_came_in", false)));
}

/// Keeps its connection so timers can pause and resume it.
#[derive(Default)]
struct Holder {
    conn: RefCell<Option<Connection>>,
    data: RefCell<Vec<u8>>,
}

impl Handler for Holder {
    fn connection_made(&self, conn: &Connection) -> HandlerResult {
        *self.conn.borrow_mut() = Some(conn.clone());
        Ok(())
    }

    fn data_came_in(&self, _source: DataSource<'_>, data: &[u8]) -> HandlerResult {
        self.data.borrow_mut().extend_from_slice(data);
        Ok(())
    }

    fn connection_lost(&self, _conn: &Connection) -> HandlerResult {
        self.conn.borrow_mut().take();
        Ok(())
    }
}

#[test]
fn test_pause_from_timer_holds_back_data() {
    let server = server(Config::default());
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let holder = Rc::new(Holder::default());
    assert_ok!(server.start_listening(&socket, holder.clone(), None));

    let paused = Rc::clone(&holder);
    server.add_task(Duration::from_millis(150), move || {
        if let Some(conn) = paused.conn.borrow().as_ref() {
            conn.pause_reading();
        }
    });
    let held = Rc::new(RefCell::new(None));
    let snapshot = Rc::clone(&held);
    let resumed = Rc::clone(&holder);
    server.add_task(Duration::from_millis(500), move || {
        *snapshot.borrow_mut() = Some(resumed.data.borrow().clone());
        if let Some(conn) = resumed.conn.borrow().as_ref() {
            conn.resume_reading();
        }
    });
    let done = DoneFlag::new();
    let finish = done.clone();
    server.add_task(Duration::from_millis(800), move || finish.set());

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        stream.write_all(b"early").unwrap();
        thread::sleep(Duration::from_millis(300));
        stream.write_all(b"late").unwrap();
        thread::sleep(Duration::from_millis(600));
    });
    run(&server, &done);
    peer.join().unwrap();

    assert_eq!(held.borrow().as_deref(), Some(&b"early"[..]));
    assert_eq!(*holder.data.borrow(), b"earlylate");
}

#[test]
fn test_listener_restarts_while_running() {
    let server = server(Config::default());
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let first = Recorder::new();
    assert_ok!(server.start_listening(&socket, first.clone(), None));

    let done = DoneFlag::new();
    let second = Recorder::echoing();
    second.finish_with(&done);
    let restarts = Rc::new(RefCell::new(Vec::new()));

    let weak = server.downgrade();
    let restarted = socket.clone();
    let handler = second.clone();
    let results = Rc::clone(&restarts);
    server.add_task(Duration::from_millis(50), move || {
        let Some(server) = weak.upgrade() else {
            return;
        };
        for _ in 0..3 {
            server.stop_listening(&restarted);
            let result = server.start_listening(&restarted, handler.clone(), None);
            results.borrow_mut().push(result.map_err(|e| e.to_string()));
        }
    });

    let peer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        let mut stream = connect(addr);
        stream.write_all(b"again").unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).unwrap();
        reply
    });
    run(&server, &done);

    assert_eq!(*restarts.borrow(), vec![Ok(()), Ok(()), Ok(())]);
    assert_eq!(&peer.join().unwrap(), b"again");
    assert!(first.events().is_empty());
    assert_eq!(second.received(), b"again");
    assert!(socket.is_listening());
}

#[test]
fn test_external_tasks_run_on_loop_thread_in_order() {
    let server = server(Config::default());
    let handle = server.handle();
    let done = DoneFlag::new();
    let loop_thread = thread::current().id();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancelled_ran = Arc::new(AtomicBool::new(false));

    let submitter = {
        let seen = Arc::clone(&seen);
        let cancelled_ran = Arc::clone(&cancelled_ran);
        let done = done.clone();
        thread::spawn(move || {
            for i in 0..5 {
                let seen = Arc::clone(&seen);
                handle.external_add_task(Duration::ZERO, move |_| {
                    seen.lock().unwrap().push((i, thread::current().id()));
                });
            }
            let cancelled = handle.external_add_task(Duration::from_millis(100), move |_| {
                cancelled_ran.store(true, Ordering::SeqCst);
            });
            cancelled.cancel();
            handle.external_add_task(Duration::from_millis(300), move |_| done.set());
        })
    };
    run(&server, &done);
    submitter.join().unwrap();

    let seen = seen.lock().unwrap();
    let order: Vec<u32> = seen.iter().map(|(i, _)| *i).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert!(seen.iter().all(|(_, id)| *id == loop_thread));
    assert!(!cancelled_ran.load(Ordering::SeqCst));
}

#[test]
fn test_external_task_can_use_server() {
    let server = server(Config::default());
    let done = DoneFlag::new();
    let finish = done.clone();
    server.external_add_task(Duration::ZERO, move |server| {
        server.add_task(Duration::from_millis(20), move || finish.set());
    });
    run(&server, &done);
    assert!(done.is_set());
}

#[test]
fn test_tasks_submitted_after_stop_are_dropped() {
    let server = server(Config::default());
    let handle = server.handle();
    server.stop();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    handle.external_add_task(Duration::ZERO, move |_| flag.store(true, Ordering::SeqCst));

    // The loop sees the earlier stop and returns at once
    run(&server, &DoneFlag::new());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_graceful_shutdown_delivers_every_loss_once() {
    let server = server(Config::default().with_shutdown_grace(Duration::from_millis(200)));
    let mocks = [
        Rc::new(MockTransport::new()),
        Rc::new(MockTransport::new()),
        Rc::new(MockTransport::new().failing_close()),
    ];
    let recorders: Vec<Rc<Recorder>> = mocks.iter().map(|_| Recorder::new()).collect();
    for (mock, recorder) in mocks.iter().zip(&recorders) {
        let conn = Connection::new(
            &server,
            SocketKind::Tcp,
            Some(Rc::clone(recorder) as Rc<dyn Handler>),
            None,
            0,
        );
        attach_mock(&server, &conn, mock, WriteStrategy::Pull).connection_made();
    }
    assert_eq!(server.connection_count(), 3);

    let weak = server.downgrade();
    server.add_task(Duration::from_millis(50), move || {
        if let Some(server) = weak.upgrade() {
            server.stop();
        }
    });
    let started = Instant::now();
    run(&server, &DoneFlag::new());

    // The connection that refused to close held the loop for the grace period
    assert!(started.elapsed() >= Duration::from_millis(200));
    for recorder in &recorders {
        assert_eq!(recorder.events(), vec![Event::Made, Event::Lost]);
    }
    for mock in &mocks {
        assert_eq!(mock.closes.get(), 1);
    }
    assert_eq!(server.connection_count(), 0);
}

/// Answers every datagram with "pong".
#[derive(Default)]
struct Pong {
    conn: RefCell<Option<Connection>>,
    seen: RefCell<Vec<(SocketAddr, Vec<u8>)>>,
    lost: Cell<bool>,
}

impl Handler for Pong {
    fn data_came_in(&self, source: DataSource<'_>, data: &[u8]) -> HandlerResult {
        if let DataSource::Datagram(from) = source {
            self.seen.borrow_mut().push((from, data.to_vec()));
            if let Some(conn) = self.conn.borrow().as_ref() {
                conn.sendto(b"pong", from);
            }
        }
        Ok(())
    }

    fn connection_lost(&self, _conn: &Connection) -> HandlerResult {
        self.lost.set(true);
        Ok(())
    }
}

#[test]
fn test_udp_ping_pong() {
    let server = server(Config::default());
    let socket = assert_ok!(server.create_udpsocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let pong = Rc::new(Pong::default());
    *pong.conn.borrow_mut() = socket.connection();
    assert_ok!(server.start_listening_udp(&socket, pong.clone(), None));

    let done = DoneFlag::new();
    let finish = done.clone();
    let peer = thread::spawn(move || {
        let client = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        client.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
        client.send_to(b"ping", addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        finish.set();
        (buf[..n].to_vec(), from, client.local_addr().unwrap())
    });
    run(&server, &done);

    let (reply, from, client_addr) = peer.join().unwrap();
    assert_eq!(reply, b"pong");
    assert_eq!(from, addr);
    assert_eq!(*pong.seen.borrow(), vec![(client_addr, b"ping".to_vec())]);
    // Datagram sockets are retired without a loss callback
    assert!(!pong.lost.get());
    assert_eq!(server.udp_socket_count(), 0);
}

#[cfg(unix)]
#[test]
fn test_unix_echo() {
    use std::os::unix::net::UnixStream;

    let server = server(Config::default());
    let path = std::env::temp_dir().join(format!("rawserver-{}.sock", uuid::Uuid::new_v4()));
    let socket = assert_ok!(server.create_unixserversocket(&path));
    let done = DoneFlag::new();
    let recorder = Recorder::echoing();
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&socket, recorder.clone(), None));

    let client_path = path.clone();
    let peer = thread::spawn(move || {
        let mut stream = UnixStream::connect(client_path).unwrap();
        stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
        stream.write_all(b"hi").unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).unwrap();
        reply
    });
    run(&server, &done);

    assert_eq!(&peer.join().unwrap(), b"hi");
    assert_eq!(recorder.received(), b"hi");
    assert_eq!(recorder.count(&Event::Lost), 1);

    server.stop_listening(&socket);
    assert!(!path.exists());
}

/// Sends one response, then half-closes.
struct Responder {
    done: DoneFlag,
}

impl Handler for Responder {
    fn data_came_in(&self, source: DataSource<'_>, _data: &[u8]) -> HandlerResult {
        if let DataSource::Stream(conn) = source {
            conn.write("resp");
            conn.shutdown(Shutdown::Write)?;
        }
        Ok(())
    }

    fn connection_lost(&self, _conn: &Connection) -> HandlerResult {
        self.done.set();
        Ok(())
    }
}

#[test]
fn test_half_close_after_response() {
    let server = server(Config::default());
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    assert_ok!(server.start_listening(&socket, Rc::new(Responder { done: done.clone() }), None));

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        stream.write_all(b"req").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    });
    run(&server, &done);

    assert_eq!(peer.join().unwrap(), b"resp");
}

#[test]
fn test_stop_listening_keeps_accepted_connections() {
    let server = server(Config::default());
    let socket = assert_ok!(server.create_serversocket(0, Some(LOCALHOST), 0));
    let addr = socket.local_addr().expect("bound");
    let done = DoneFlag::new();
    let recorder = Recorder::echoing();
    recorder.finish_with(&done);
    assert_ok!(server.start_listening(&socket, recorder.clone(), None));

    // Stop accepting as soon as the first connection arrives
    let stopper = socket.clone();
    let weak = server.downgrade();
    let hook: Rc<dyn Fn()> = Rc::new(move || {
        if let Some(server) = weak.upgrade() {
            server.stop_listening(&stopper);
        }
    });

    let peer = thread::spawn(move || {
        let mut stream = connect(addr);
        stream.write_all(b"one").unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).unwrap();
        // Give the loop time to stop listening before the second request
        thread::sleep(Duration::from_millis(100));
        stream.write_all(b"two").unwrap();
        stream.read_exact(&mut reply).unwrap();
        reply
    });

    fn poll(server: WeakRawServer, hook: Rc<dyn Fn()>) {
        let Some(live) = server.upgrade() else {
            return;
        };
        if live.connection_count() > 0 {
            hook();
        } else {
            live.add_task(Duration::from_millis(5), move || poll(server, hook));
        }
    }
    poll(server.downgrade(), hook);
    run(&server, &done);

    assert_eq!(&peer.join().unwrap(), b"two");
    assert!(!socket.is_listening());
    assert_eq!(recorder.received(), b"onetwo");
    assert_err!(TcpStream::connect(addr));
}

#[test]
#[should_panic(expected = "listen_forever() should only be called once")]
fn test_listen_forever_only_once() {
    let server = server(Config::default());
    let done = DoneFlag::new();
    done.set();
    server.listen_forever(done.clone());
    server.listen_forever(done);
}

#[test]
fn test_sigint_handler_installs_once() {
    let server = server(Config::default());
    assert_ok!(server.install_sigint_handler(None));
    assert_err!(server.install_sigint_handler(None));
}
