//! Device and client sessions against a live server

use chrono::Utc;
use nightwatch_coordinator::{Coordinator, CoordinatorServer};
use nightwatch_core::Config;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct Session {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn next(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("line in time")
            .unwrap()
            .expect("connection open")
    }

    /// Read until a line matching `wanted` arrives, returning everything seen
    async fn until(&mut self, wanted: impl Fn(&str) -> bool) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = self.next().await;
            let done = wanted(&line);
            seen.push(line);
            if done {
                return seen;
            }
        }
    }
}

fn is_reply(line: &str) -> bool {
    line.starts_with('+') || line.starts_with('-')
}

async fn serve() -> (SocketAddr, oneshot::Sender<()>) {
    let mut config = Config::default_config();
    config.observatory.required_devices = vec!["dome".into()];
    config.observatory.open_sequence = Vec::new();
    let server = CoordinatorServer::bind("127.0.0.1:0", Coordinator::new(config, Utc::now()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));
    (addr, stop_tx)
}

#[tokio::test]
async fn test_status_is_relayed_to_clients() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, stop) = serve().await;

    let mut dome = Session::open(addr).await;
    dome.send("register 1 dome 4 localhost 5555").await;
    let sync = dome.until(is_reply).await;
    assert!(sync[0].starts_with("A registered_as "));
    assert_eq!(sync.last().unwrap(), "+000 OK");

    let mut alice = Session::open(addr).await;
    alice.send("login alice alice").await;
    let sync = alice.until(is_reply).await;
    assert!(sync.iter().any(|l| l.starts_with("I status 1 dome ")));
    assert!(sync.contains(&"V weather_safe 1".to_string()));

    dome.send("S dome 16777216 \"\"").await;
    alice.until(|l| l == "S dome 16777216 \"\"").await;

    dome.send("S dome 2147483648 \"rain\"").await;
    let seen = alice.until(|l| l == "V weather_safe 0").await;
    assert!(seen.contains(&"S dome 2147483648 \"rain\"".to_string()));

    stop.send(()).unwrap();
}

#[tokio::test]
async fn test_status_info_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, stop) = serve().await;

    let mut dome = Session::open(addr).await;
    dome.send("register 1 dome 4 localhost 5555").await;
    dome.until(is_reply).await;

    let mut alice = Session::open(addr).await;
    alice.send("login alice alice").await;
    alice.until(is_reply).await;

    alice.send("status_info").await;
    dome.until(|l| l == "status_info").await;
    dome.send("+000 OK").await;

    let seen = alice.until(is_reply).await;
    assert_eq!(seen.last().unwrap(), "+000 OK");

    stop.send(()).unwrap();
}

#[tokio::test]
async fn test_unknown_command_keeps_session_open() {
    let (addr, stop) = serve().await;

    let mut bob = Session::open(addr).await;
    bob.send("login bob bob").await;
    bob.until(is_reply).await;

    bob.send("warp 9").await;
    assert!(bob.until(is_reply).await.last().unwrap().starts_with("-001"));

    bob.send("info").await;
    let seen = bob.until(is_reply).await;
    assert!(seen.iter().any(|l| l.starts_with("user ") && l.ends_with(" bob bob")));
    assert_eq!(seen.last().unwrap(), "+000 OK");

    stop.send(()).unwrap();
}
