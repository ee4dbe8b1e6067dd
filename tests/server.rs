extern crate webserver;

use std::env;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use webserver::credentials::{CredentialStore, UserTable};
use webserver::{Config, Server, Shutdown, TimerKind};

static NEXT_ROOT: AtomicUsize = AtomicUsize::new(0);

/// A document root populated with the pages the server links to.
struct Root {
    path: PathBuf,
}

impl Root {
    fn new() -> Self {
        let path = env::temp_dir().join(format!(
            "webserver-it-{}-{}",
            process::id(),
            NEXT_ROOT.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&path).unwrap();
        let root = Root { path };
        root.write("index.html", b"<h1>index</h1>");
        root.write("404.html", b"<h1>not found</h1>");
        root.write("400.html", b"<h1>bad request</h1>");
        root.write("welcome.html", b"<h1>welcome</h1>");
        root.write("error.html", b"<h1>error</h1>");
        root
    }

    fn write(&self, name: &str, contents: &[u8]) {
        fs::write(self.path.join(name), contents).unwrap();
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

struct Running {
    port: u16,
    shutdown: Shutdown,
    thread: Option<JoinHandle<()>>,
}

impl Running {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(root: &Root) -> Config {
    Config {
        port: free_port(),
        root_dir: root.path().to_path_buf(),
        workers: 2,
        ..Config::default()
    }
}

fn start(config: Config) -> Running {
    start_with(config, Arc::new(UserTable::new(2, 4)))
}

fn start_with(config: Config, users: Arc<dyn CredentialStore>) -> Running {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut server = Server::new(Arc::new(config), users).unwrap();
        let port = server.local_addr().unwrap().port();
        tx.send((server.shutdown_handle(), port)).unwrap();
        server.run().unwrap();
    });
    let (shutdown, port) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    Running {
        port,
        shutdown,
        thread: Some(thread),
    }
}

/// Read one response, using its Content-Length to find the end of the body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let len: usize = head
        .lines()
        .find(|line| line.starts_with("Content-Length: "))
        .map(|line| line["Content-Length: ".len()..].trim().parse().unwrap())
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(0) => {}
        Ok(n) => panic!("expected the connection to close, read {} more bytes", n),
        // a reset also means the server is done with us
        Err(_) => {}
    }
}

#[test]
fn serves_static_files() {
    let root = Root::new();
    let server = start(config(&root));

    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200 OK \r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert!(head.contains("Content-Type: text/html\r\n"));
    assert_eq!(body, b"<h1>index</h1>");
    assert_closed(&mut stream);
}

#[test]
fn missing_files_get_the_404_page() {
    let root = Root::new();
    let server = start(config(&root));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing.png HTTP/1.1\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 404 Not Found \r\n"));
    assert_eq!(body, b"<h1>not found</h1>");
}

#[test]
fn malformed_requests_get_400_and_close() {
    let root = Root::new();
    let server = start(config(&root));

    let mut stream = server.connect();
    stream.write_all(b"GET /index\r\n").unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 400 Bad Request \r\n"));
    assert_eq!(body, b"<h1>bad request</h1>");
    assert_closed(&mut stream);
}

#[test]
fn paths_cannot_leave_the_document_root() {
    let root = Root::new();
    root.write("secret.txt", b"top secret");
    let www = root.path().join("www");
    fs::create_dir_all(&www).unwrap();
    fs::write(www.join("404.html"), b"<h1>not found</h1>").unwrap();
    let server = start(Config {
        root_dir: www,
        ..config(&root)
    });

    for path in &["/../secret.txt", "/css/../../secret.txt"] {
        let mut stream = server.connect();
        let request = format!("GET {} HTTP/1.1\r\n\r\n", path);
        stream.write_all(request.as_bytes()).unwrap();
        let (head, body) = read_response(&mut stream);

        assert!(head.starts_with("HTTP/1.1 404 Not Found \r\n"), "{}", path);
        assert_eq!(body, b"<h1>not found</h1>");
    }
}

#[test]
fn keep_alive_serves_many_requests() {
    let root = Root::new();
    root.write("style.css", b"body {}");
    let server = start(config(&root));

    let mut stream = server.connect();
    for _ in 0..3 {
        stream
            .write_all(b"GET /style.css HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive\r\nkeep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-Type: text/css\r\n"));
        assert_eq!(body, b"body {}");
    }
}

#[test]
fn registration_then_login() {
    let root = Root::new();
    let server = start(config(&root));

    let post = |path: &str, form: &str| {
        let mut stream = server.connect();
        let request = format!(
            "POST {} HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\r\n{}",
            path,
            form.len(),
            form
        );
        stream.write_all(request.as_bytes()).unwrap();
        read_response(&mut stream).1
    };

    assert_eq!(post("/login", "username=ada&password=pw"), b"<h1>error</h1>");
    assert_eq!(post("/register", "username=ada&password=pw"), b"<h1>welcome</h1>");
    assert_eq!(post("/register", "username=ada&password=pw"), b"<h1>error</h1>");
    assert_eq!(post("/login", "username=ada&password=pw"), b"<h1>welcome</h1>");
    assert_eq!(post("/login", "username=ada&password=nope"), b"<h1>error</h1>");
}

#[test]
fn requests_split_across_packets() {
    let root = Root::new();
    let server = start(config(&root));

    let mut stream = server.connect();
    stream.write_all(b"GET /index.html HT").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"TP/1.1\r\nHost: localhost\r\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"\r\n").unwrap();

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK \r\n"));
    assert_eq!(body, b"<h1>index</h1>");
}

/// A credential store that records how many checks overlap.
#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl CredentialStore for Overlap {
    fn verify_or_register(&self, _: &str, _: &str, _: bool) -> bool {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[test]
fn a_connection_runs_one_task_at_a_time() {
    const REQUESTS: usize = 20;

    let root = Root::new();
    let users = Arc::new(Overlap::default());
    let server = start_with(
        Config {
            workers: 4,
            ..config(&root)
        },
        users.clone(),
    );

    let mut stream = server.connect();
    let form = "username=ada&password=pw";
    let request = format!(
        "POST /login HTTP/1.1\r\n\
         Connection: keep-alive\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n{}",
        form.len(),
        form
    );

    // keep writing while earlier requests are still being handled
    let mut writer = stream.try_clone().unwrap();
    let sender = thread::spawn(move || {
        for _ in 0..REQUESTS {
            writer.write_all(request.as_bytes()).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    });

    for _ in 0..REQUESTS {
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK \r\n"));
        assert_eq!(body, b"<h1>welcome</h1>");
    }
    sender.join().unwrap();

    assert_eq!(users.calls.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(users.peak.load(Ordering::SeqCst), 1);
}

fn evicts_idle_clients(timer: TimerKind) {
    let root = Root::new();
    let server = start(Config {
        timer,
        timeout_ms: 200,
        wheel_cadence_ms: 50,
        ..config(&root)
    });

    let started = Instant::now();
    let mut stream = server.connect();
    assert_closed(&mut stream);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn heap_timer_evicts_idle_clients() {
    evicts_idle_clients(TimerKind::Heap);
}

#[test]
fn wheel_timer_evicts_idle_clients() {
    evicts_idle_clients(TimerKind::Wheel);
}

#[test]
fn turns_clients_away_when_full() {
    let root = Root::new();
    let server = start(Config {
        max_connections: 1,
        ..config(&root)
    });

    let _first = server.connect();
    thread::sleep(Duration::from_millis(100));

    let mut second = server.connect();
    let mut reply = Vec::new();
    let _ = second.read_to_end(&mut reply);
    assert_eq!(reply, b"Server busy!");
}

#[test]
fn level_triggered_mode_serves_large_files() {
    let root = Root::new();
    let body: Vec<u8> = (0..2_000_000u32).map(|i| (i % 253) as u8).collect();
    root.write("video.mp4", &body);
    let server = start(Config {
        trigger_mode: 0,
        ..config(&root)
    });

    let mut stream = server.connect();
    stream
        .write_all(b"GET /video.mp4 HTTP/1.1\r\n\r\n")
        .unwrap();
    let (head, received) = read_response(&mut stream);

    assert!(head.contains("Content-Length: 2000000\r\n"));
    assert!(received == body);
}

#[test]
fn shutdown_stops_the_server() {
    let root = Root::new();
    let mut server = start(config(&root));

    server.shutdown.shutdown();
    server.thread.take().unwrap().join().unwrap();
    assert!(TcpStream::connect(("127.0.0.1", server.port)).is_err());
}
