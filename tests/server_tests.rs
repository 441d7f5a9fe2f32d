use std::{sync::Arc, time::Duration};

use pvars::{
    Config, SearchOperation, Source,
    messages::{Beacon, SearchRequest, SearchResponse},
};
use tokio::{net::UdpSocket, time::timeout};
use tracing::{info, level_filters::LevelFilter};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

struct NamedSource(&'static str);

impl Source for NamedSource {
    fn on_search(&self, op: &mut SearchOperation) {
        for name in op.names_mut() {
            if name.name() == self.0 {
                name.claim();
            }
        }
    }
}

struct BrokenSource;

impl Source for BrokenSource {
    fn on_search(&self, _op: &mut SearchOperation) {
        panic!("search handling went wrong");
    }
}

fn local_config() -> Config {
    Config::new()
        .interfaces(vec!["127.0.0.1".to_string()])
        .tcp_port(0)
        .udp_port(0)
        .auto_beacon(false)
}

#[tokio::test]
async fn search_over_the_wire() {
    init_logging();
    let server = local_config().build().unwrap();
    server
        .add_source("names", Arc::new(NamedSource("yyy")), 0)
        .unwrap();
    server.start().await;
    let udp_port = server.config().udp_port;
    info!("server listening for searches on {udp_port}");

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = SearchRequest {
        search_id: 77,
        must_reply: false,
        unicast: true,
        reply_port: client.local_addr().unwrap().port(),
        names: vec![(1, "xxx".to_string()), (2, "yyy".to_string())],
    };
    client
        .send_to(&request.to_bytes(), ("127.0.0.1", udp_port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (size, _) = timeout(Duration::from_secs(4), client.recv_from(&mut buf))
        .await
        .expect("no search response arrived")
        .unwrap();
    let response = SearchResponse::parse(&buf[..size]).unwrap();
    assert_eq!(response.guid, server.guid());
    assert_eq!(response.search_id, 77);
    assert_eq!(response.tcp_port, server.config().tcp_port);
    assert!(response.found);
    assert_eq!(response.ids, vec![2]);

    server.stop().await;
}

#[tokio::test]
async fn unclaimed_search_is_silent_unless_demanded() {
    init_logging();
    let server = local_config().build().unwrap();
    server.start().await;
    let udp_port = server.config().udp_port;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut request = SearchRequest {
        search_id: 5,
        names: vec![(9, "no-such-pv".to_string())],
        ..Default::default()
    };
    client
        .send_to(&request.to_bytes(), ("127.0.0.1", udp_port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(500), client.recv_from(&mut buf))
            .await
            .is_err(),
        "got a reply for an unclaimed search without mustReply"
    );

    request.must_reply = true;
    client
        .send_to(&request.to_bytes(), ("127.0.0.1", udp_port))
        .await
        .unwrap();
    let (size, _) = timeout(Duration::from_secs(4), client.recv_from(&mut buf))
        .await
        .expect("mustReply search got no response")
        .unwrap();
    let response = SearchResponse::parse(&buf[..size]).unwrap();
    assert!(!response.found);
    assert!(response.ids.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn panicking_source_does_not_block_others() {
    init_logging();
    let server = local_config().build().unwrap();
    server.add_source("broken", Arc::new(BrokenSource), 0).unwrap();
    server
        .add_source("names", Arc::new(NamedSource("pv")), 1)
        .unwrap();
    server.start().await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = SearchRequest {
        search_id: 13,
        names: vec![(6, "pv".to_string())],
        ..Default::default()
    };
    client
        .send_to(&request.to_bytes(), ("127.0.0.1", server.config().udp_port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (size, _) = timeout(Duration::from_secs(4), client.recv_from(&mut buf))
        .await
        .expect("no response after a source panicked")
        .unwrap();
    let response = SearchResponse::parse(&buf[..size]).unwrap();
    assert_eq!(response.ids, vec![6]);

    server.stop().await;
}

#[tokio::test]
async fn beacons_start_and_stop_with_the_server() {
    init_logging();
    let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let beacon_addr = receiver.local_addr().unwrap();

    let server = local_config()
        .beacon_destinations(vec![beacon_addr.to_string()])
        .beacon_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    server.start().await;

    // the first beacon goes out immediately, the next after one interval
    let mut buf = [0u8; 256];
    for _ in 0..2 {
        let (size, _) = timeout(Duration::from_secs(4), receiver.recv_from(&mut buf))
            .await
            .expect("no beacon arrived")
            .unwrap();
        let beacon = Beacon::parse(&buf[..size]).unwrap();
        assert_eq!(beacon.guid, server.guid());
        assert_eq!(beacon.tcp_port, server.config().tcp_port);
    }

    server.stop().await;

    // drain anything sent before the stop, then expect silence
    while timeout(Duration::from_millis(300), receiver.recv_from(&mut buf))
        .await
        .is_ok()
    {}
    assert!(
        timeout(Duration::from_millis(400), receiver.recv_from(&mut buf))
            .await
            .is_err(),
        "beacons kept arriving after stop"
    );
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    init_logging();
    let server = local_config().build().unwrap();

    // stopping a stopped server does nothing
    server.stop().await;
    server.start().await;
    // a second start is ignored
    server.start().await;

    // TCP acceptor is live while running
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", server.config().tcp_port)).await;
    assert!(stream.is_ok(), "could not connect to the running server");

    server.stop().await;
    server.stop().await;

    // and the cycle can begin again
    server.start().await;
    server.stop().await;
}

#[tokio::test]
async fn run_blocks_until_interrupted() {
    init_logging();
    let server = local_config().build().unwrap();

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    // give the runner a moment to come up, then wake it
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.interrupt();

    timeout(Duration::from_secs(4), runner)
        .await
        .expect("run() did not return after interrupt()")
        .unwrap();
}
