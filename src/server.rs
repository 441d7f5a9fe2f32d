//! The discovery/dispatch spine of a PVA server.
//!
//! A [`Server`] owns its sockets from construction: [`Config::build`] binds
//! the TCP acceptors and reuse-port UDP search sockets, resolves beacon
//! destinations and publishes the effective configuration. [`Server::start`]
//! then arms everything as tokio tasks and [`Server::stop`] tears them down
//! again, cycling `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! PV names are claimed by [`Source`]s held in a registry ordered by
//! `(order, name)`. Incoming searches are offered to every source in that
//! order; claimed names are echoed back in the search response.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    io,
    net::{Ipv4Addr, SocketAddrV4},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::{
    net::{TcpListener, UdpSocket},
    select,
    sync::{Mutex, Notify},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    messages::{Beacon, SearchRequest, SearchResponse},
    source::{SearchOperation, ServerSource, Source},
    utils::{
        broadcast_addrs_for, new_reusable_udp_socket, parse_beacon_dest, parse_port,
        parse_yes_no, pick_env, primary_local_ipv4, split_addr_list,
    },
};

/// Default TCP port for PVA connections.
pub const DEFAULT_TCP_PORT: u16 = 5075;
/// Default UDP port for searches and beacons.
pub const DEFAULT_UDP_PORT: u16 = 5076;

const BEACON_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("source already registered : ({name}, {order})")]
    DuplicateSource { name: String, order: i32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Server configuration, from the environment or built up by hand.
///
/// After [`build`](Config::build) the server publishes an *effective* copy
/// with every interface and beacon destination resolved to a concrete
/// address string and `auto_beacon` consumed.
#[derive(Debug, Clone)]
pub struct Config {
    /// IPv4 interfaces to bind; empty means the wildcard.
    pub interfaces: Vec<String>,
    /// Explicit beacon destinations, `addr` or `addr:port`.
    pub beacon_destinations: Vec<String>,
    /// Also beacon to the broadcast addresses of every bound interface.
    pub auto_beacon: bool,
    /// TCP port to accept connections on; 0 picks an ephemeral port.
    pub tcp_port: u16,
    /// UDP port to listen for searches on; 0 picks an ephemeral port.
    pub udp_port: u16,
    /// Delay between beacons.
    pub beacon_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interfaces: Vec::new(),
            beacon_destinations: Vec::new(),
            auto_beacon: true,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            beacon_interval: BEACON_INTERVAL,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Build a configuration from the `EPICS_PVAS_*`/`EPICS_PVA_*`
    /// environment. Invalid values log an error and keep the default.
    pub fn from_env() -> Config {
        let mut ret = Config::default();

        if let Some((name, value)) = pick_env(&["EPICS_PVAS_INTF_ADDR_LIST"]) {
            ret.interfaces = split_addr_list(name, &value);
        }
        if let Some((name, value)) =
            pick_env(&["EPICS_PVAS_BEACON_ADDR_LIST", "EPICS_PVA_ADDR_LIST"])
        {
            ret.beacon_destinations = split_addr_list(name, &value);
        }
        if let Some((name, value)) = pick_env(&[
            "EPICS_PVAS_AUTO_BEACON_ADDR_LIST",
            "EPICS_PVA_AUTO_ADDR_LIST",
        ]) && let Some(auto) = parse_yes_no(name, &value)
        {
            ret.auto_beacon = auto;
        }
        if let Some((name, value)) = pick_env(&["EPICS_PVAS_SERVER_PORT", "EPICS_PVA_SERVER_PORT"])
            && let Some(port) = parse_port(name, &value)
        {
            ret.tcp_port = port;
        }
        if let Some((name, value)) =
            pick_env(&["EPICS_PVAS_BROADCAST_PORT", "EPICS_PVA_BROADCAST_PORT"])
            && let Some(port) = parse_port(name, &value)
        {
            ret.udp_port = port;
        }

        ret
    }

    pub fn interfaces(mut self, interfaces: Vec<String>) -> Config {
        self.interfaces = interfaces;
        self
    }

    pub fn beacon_destinations(mut self, destinations: Vec<String>) -> Config {
        self.beacon_destinations = destinations;
        self
    }

    pub fn auto_beacon(mut self, auto: bool) -> Config {
        self.auto_beacon = auto;
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Config {
        self.tcp_port = port;
        self
    }

    pub fn udp_port(mut self, port: u16) -> Config {
        self.udp_port = port;
        self
    }

    pub fn beacon_interval(mut self, interval: Duration) -> Config {
        self.beacon_interval = interval;
        self
    }

    /// Bind sockets, resolve the effective configuration and derive the
    /// server GUID. The server starts out `Stopped`.
    pub fn build(self) -> Result<Server, ServerError> {
        Server::new(self)
    }
}

fn parse_interface(entry: &str) -> io::Result<Ipv4Addr> {
    let parsed = if entry.contains(':') {
        entry.parse::<SocketAddrV4>().map(|addr| *addr.ip())
    } else {
        entry.parse::<Ipv4Addr>()
    };
    parsed.map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface address '{entry}'"),
        )
    })
}

/// 12-byte instance identifier sent in search replies and beacons.
///
/// XOR-folds the construction time, the host's addresses, and
/// process-local entropy (pid, port, allocation address).
fn derive_guid(tcp_port: u16, token: usize) -> [u8; 12] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut words = [0u32; 3];
    words[0] = (now.as_secs() as u32) ^ now.subsec_nanos();

    words[1] = primary_local_ipv4().map(u32::from).unwrap_or_default();
    for broadcast in broadcast_addrs_for(Ipv4Addr::UNSPECIFIED) {
        words[1] ^= u32::from(broadcast);
    }

    words[2] = std::process::id() ^ ((tcp_port as u32) << 16);
    words[2] ^= token as u32;
    words[2] ^= ((token as u64) >> 32) as u32;

    let mut guid = [0u8; 12];
    for (chunk, word) in guid.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    guid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct RunState {
    state: State,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

type SourceMap = BTreeMap<(i32, String), Arc<dyn Source>>;

struct Inner {
    effective: Config,
    guid: [u8; 12],
    sources: RwLock<SourceMap>,
    run: Mutex<RunState>,
    done: Notify,
    tcp_listeners: Vec<std::net::TcpListener>,
    udp_listeners: Vec<std::net::UdpSocket>,
    beacon_dest: Vec<std::net::SocketAddr>,
}

/// Slot claimed by the single server per process that listens for signals.
static SIGNAL_SLOT: AtomicBool = AtomicBool::new(false);

/// Handle to a PVA server; cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    fn new(mut conf: Config) -> Result<Server, ServerError> {
        // the empty interface list implies the wildcard
        if conf.interfaces.is_empty() {
            conf.interfaces.push("0.0.0.0".to_string());
        }

        let mut tcp_listeners = Vec::new();
        for (index, entry) in conf.interfaces.iter().enumerate() {
            let addr = parse_interface(entry)?;
            let listener = std::net::TcpListener::bind((addr, conf.tcp_port))?;
            listener.set_nonblocking(true)?;
            if index == 0 {
                conf.tcp_port = listener.local_addr()?.port();
            }
            tcp_listeners.push(listener);
        }

        let mut udp_listeners = Vec::new();
        for entry in &conf.interfaces {
            let addr = parse_interface(entry)?;
            let socket = new_reusable_udp_socket((addr, conf.udp_port))?;
            if conf.udp_port == 0 {
                conf.udp_port = socket.local_addr()?.port();
            }
            udp_listeners.push(socket);
        }

        let mut beacon_dest = Vec::new();
        for entry in &conf.beacon_destinations {
            match parse_beacon_dest(entry, conf.udp_port) {
                Some(addr) => beacon_dest.push(addr),
                None => error!("ignoring invalid beacon destination '{entry}'"),
            }
        }
        if conf.auto_beacon {
            // append broadcast addresses of every bound interface
            for entry in &conf.interfaces {
                let addr = parse_interface(entry)?;
                for broadcast in broadcast_addrs_for(addr) {
                    beacon_dest.push((broadcast, conf.udp_port).into());
                }
            }
            conf.auto_beacon = false;
        }

        // publish the resolved addresses as the effective config
        conf.interfaces = tcp_listeners
            .iter()
            .map(|listener| Ok(listener.local_addr()?.to_string()))
            .collect::<io::Result<_>>()?;
        conf.beacon_destinations = beacon_dest.iter().map(|addr| addr.to_string()).collect();

        let tcp_port = conf.tcp_port;
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut sources: SourceMap = BTreeMap::new();
            sources.insert(
                (-1, "server".to_string()),
                Arc::new(ServerSource) as Arc<dyn Source>,
            );
            Inner {
                effective: conf,
                guid: derive_guid(tcp_port, weak.as_ptr() as usize),
                sources: RwLock::new(sources),
                run: Mutex::new(RunState {
                    state: State::Stopped,
                    cancel: CancellationToken::new(),
                    tasks: JoinSet::new(),
                }),
                done: Notify::new(),
                tcp_listeners,
                udp_listeners,
                beacon_dest,
            }
        });

        Ok(Server { inner })
    }

    /// The effective configuration: concrete ports, bound interfaces and
    /// resolved beacon destinations.
    pub fn config(&self) -> &Config {
        &self.inner.effective
    }

    pub fn guid(&self) -> [u8; 12] {
        self.inner.guid
    }

    /// Register a source at `(order, name)`; duplicates are rejected.
    pub fn add_source(
        &self,
        name: &str,
        source: Arc<dyn Source>,
        order: i32,
    ) -> Result<(), ServerError> {
        let mut sources = self.inner.sources.write().unwrap();
        match sources.entry((order, name.to_string())) {
            Entry::Occupied(_) => Err(ServerError::DuplicateSource {
                name: name.to_string(),
                order,
            }),
            Entry::Vacant(slot) => {
                slot.insert(source);
                Ok(())
            }
        }
    }

    pub fn remove_source(&self, name: &str, order: i32) -> Option<Arc<dyn Source>> {
        self.inner
            .sources
            .write()
            .unwrap()
            .remove(&(order, name.to_string()))
    }

    pub fn get_source(&self, name: &str, order: i32) -> Option<Arc<dyn Source>> {
        self.inner
            .sources
            .read()
            .unwrap()
            .get(&(order, name.to_string()))
            .cloned()
    }

    /// Registered `(name, order)` pairs in registry order.
    pub fn list_sources(&self) -> Vec<(String, i32)> {
        self.inner
            .sources
            .read()
            .unwrap()
            .keys()
            .map(|(order, name)| (name.clone(), *order))
            .collect()
    }

    /// Arm acceptors, search listeners and the beacon timer. A no-op unless
    /// the server is `Stopped`. Individual socket failures are logged and
    /// skipped; the server still comes up.
    pub async fn start(&self) {
        let mut run = self.inner.run.lock().await;
        if run.state != State::Stopped {
            debug!("server not stopped, ignoring start");
            return;
        }
        run.state = State::Starting;
        debug!("server starting");

        let cancel = CancellationToken::new();
        run.cancel = cancel.clone();

        for listener in &self.inner.tcp_listeners {
            match listener.try_clone().and_then(TcpListener::from_std) {
                Ok(listener) => {
                    run.tasks.spawn(accept_loop(listener, cancel.clone()));
                }
                Err(e) => error!("error enabling listener: {e}"),
            }
        }

        for socket in &self.inner.udp_listeners {
            match socket.try_clone().and_then(UdpSocket::from_std) {
                Ok(socket) => {
                    run.tasks
                        .spawn(search_loop(socket, Arc::downgrade(&self.inner), cancel.clone()));
                }
                Err(e) => error!("error enabling search listener: {e}"),
            }
        }

        match std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.set_nonblocking(true)?;
                socket.set_broadcast(true)?;
                UdpSocket::from_std(socket)
            }) {
            Ok(socket) => {
                let beacon = Beacon {
                    guid: self.inner.guid,
                    tcp_port: self.inner.effective.tcp_port,
                };
                run.tasks.spawn(beacon_loop(
                    socket,
                    beacon,
                    self.inner.beacon_dest.clone(),
                    self.inner.effective.beacon_interval,
                    cancel.clone(),
                ));
            }
            Err(e) => error!("error enabling beacon timer: {e}"),
        }

        run.state = State::Running;
        debug!("server running");
    }

    /// Cancel all spine tasks and wait for them. A no-op unless `Running`.
    pub async fn stop(&self) {
        let mut run = self.inner.run.lock().await;
        if run.state != State::Running {
            debug!("server not running, ignoring stop");
            return;
        }
        run.state = State::Stopping;
        debug!("server stopping");

        run.cancel.cancel();
        while let Some(result) = run.tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("spine task panicked during shutdown");
            }
        }

        run.state = State::Stopped;
        debug!("server stopped");
    }

    /// Start, block until [`interrupt`](Server::interrupt) (or SIGINT /
    /// SIGTERM when this server wins the per-process signal slot), then
    /// stop.
    pub async fn run(&self) {
        self.start().await;

        if SIGNAL_SLOT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            wait_done_or_signal(&self.inner.done).await;
            SIGNAL_SLOT.store(false, Ordering::Release);
        } else {
            self.inner.done.notified().await;
        }

        self.stop().await;
    }

    /// Wake a blocked [`run`](Server::run) without involving signals.
    pub fn interrupt(&self) {
        self.inner.done.notify_one();
    }
}

#[cfg(unix)]
async fn wait_done_or_signal(done: &Notify) {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    match handlers {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            select! {
                _ = done.notified() => (),
                _ = sigint.recv() => debug!("stopping on SIGINT"),
                _ = sigterm.recv() => debug!("stopping on SIGTERM"),
            }
        }
        _ => {
            error!("failed to install signal handlers");
            done.notified().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_done_or_signal(done: &Notify) {
    select! {
        _ = done.notified() => (),
        _ = tokio::signal::ctrl_c() => debug!("stopping on interrupt"),
    }
}

impl Inner {
    /// Offer a search to every source and compose the reply datagram, or
    /// `None` when nothing was claimed and no reply was demanded.
    fn handle_search(&self, request: &SearchRequest) -> Option<Vec<u8>> {
        let mut op = SearchOperation::new(&request.names);
        {
            let sources = self.sources.read().unwrap();
            for ((order, name), source) in sources.iter() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| source.on_search(&mut op)));
                if let Err(payload) = outcome {
                    error!(
                        "unhandled panic in Source::on_search for '{name}' (order {order}): {}",
                        panic_message(&payload)
                    );
                }
            }
        }

        let ids = op.claimed_ids();
        // "pvlist" breaks unless we honor the mustReply flag
        if ids.is_empty() && !request.must_reply {
            return None;
        }
        Some(
            SearchResponse {
                guid: self.guid,
                search_id: request.search_id,
                tcp_port: self.effective.tcp_port,
                found: !ids.is_empty(),
                ids,
            }
            .to_bytes(),
        )
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

async fn accept_loop(listener: TcpListener, cancel: CancellationToken) {
    debug!(
        "waiting to accept TCP connections on {:?}",
        listener.local_addr()
    );
    loop {
        let (connection, peer) = match select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        } {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept incoming connection: {e}");
                continue;
            }
        };
        // circuit setup belongs to the layer above this crate
        debug!("accepted connection from {peer}");
        drop(connection);
    }
}

async fn search_loop(socket: UdpSocket, inner: Weak<Inner>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 0xFFFF];
    debug!("listening for searches on {:?}", socket.local_addr());
    loop {
        let (size, origin) = match select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        } {
            Ok(received) => received,
            Err(e) => {
                error!("error receiving search: {e}");
                continue;
            }
        };
        let request = match SearchRequest::parse(&buf[..size]) {
            Ok(request) => request,
            Err(e) => {
                debug!("ignoring datagram from {origin}: {e}");
                continue;
            }
        };
        trace!("{origin} searching for {:?}", request.names);

        let Some(inner) = inner.upgrade() else { break };
        if let Some(reply) = inner.handle_search(&request)
            && let Err(e) = socket.send_to(&reply, origin).await
        {
            warn!("search reply to {origin} failed: {e}");
        }
    }
}

async fn beacon_loop(
    socket: UdpSocket,
    beacon: Beacon,
    destinations: Vec<std::net::SocketAddr>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let message = beacon.to_bytes();
    loop {
        for dest in &destinations {
            if let Err(e) = socket.send_to(&message, dest).await {
                warn!("beacon tx to {dest} failed: {e}");
            }
        }
        debug!("sent beacon to {} destinations", destinations.len());
        select! {
            _ = tokio::time::sleep(interval) => (),
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_server() -> Server {
        Config::new()
            .interfaces(vec!["127.0.0.1".to_string()])
            .tcp_port(0)
            .udp_port(0)
            .auto_beacon(false)
            .build()
            .unwrap()
    }

    struct ClaimOne(&'static str);
    impl Source for ClaimOne {
        fn on_search(&self, op: &mut SearchOperation) {
            for name in op.names_mut() {
                if name.name() == self.0 {
                    name.claim();
                }
            }
        }
    }

    struct Panicker;
    impl Source for Panicker {
        fn on_search(&self, _op: &mut SearchOperation) {
            panic!("this source is broken");
        }
    }

    #[test]
    fn registry_semantics() {
        let server = local_server();
        // the introspection source is pre-registered and ordered first
        assert_eq!(server.list_sources(), vec![("server".to_string(), -1)]);

        server.add_source("b", Arc::new(ClaimOne("b")), 0).unwrap();
        server.add_source("a", Arc::new(ClaimOne("a")), 0).unwrap();
        server.add_source("z", Arc::new(ClaimOne("z")), -1).unwrap();
        assert!(matches!(
            server.add_source("a", Arc::new(ClaimOne("a")), 0),
            Err(ServerError::DuplicateSource { .. })
        ));
        assert_eq!(
            server.list_sources(),
            vec![
                ("server".to_string(), -1),
                ("z".to_string(), -1),
                ("a".to_string(), 0),
                ("b".to_string(), 0),
            ]
        );

        assert!(server.get_source("a", 0).is_some());
        assert!(server.remove_source("a", 0).is_some());
        assert!(server.remove_source("a", 0).is_none());
        assert!(server.get_source("a", 0).is_none());
    }

    #[test]
    fn effective_config_is_resolved() {
        let server = local_server();
        let conf = server.config();
        assert_ne!(conf.tcp_port, 0);
        assert_ne!(conf.udp_port, 0);
        assert!(!conf.auto_beacon);
        assert_eq!(conf.interfaces.len(), 1);
        assert!(conf.interfaces[0].starts_with("127.0.0.1:"));
    }

    #[test]
    fn guids_differ_between_instances() {
        let first = local_server();
        let second = local_server();
        assert_ne!(first.guid(), second.guid());
    }

    #[test]
    fn search_claims_compose_the_reply() {
        let server = local_server();
        server.add_source("claimer", Arc::new(ClaimOne("yyy")), 0).unwrap();

        let request = SearchRequest {
            search_id: 0x600D,
            must_reply: false,
            unicast: false,
            reply_port: 0,
            names: vec![(1, "xxx".to_string()), (2, "yyy".to_string())],
        };
        let reply = server.inner.handle_search(&request).unwrap();
        let response = SearchResponse::parse(&reply).unwrap();
        assert_eq!(response.guid, server.guid());
        assert_eq!(response.search_id, 0x600D);
        assert!(response.found);
        assert_eq!(response.ids, vec![2]);
    }

    #[test]
    fn unclaimed_searches_reply_only_on_demand() {
        let server = local_server();
        let mut request = SearchRequest {
            search_id: 5,
            must_reply: false,
            unicast: false,
            reply_port: 0,
            names: vec![(1, "nothing".to_string())],
        };
        assert!(server.inner.handle_search(&request).is_none());

        request.must_reply = true;
        let response =
            SearchResponse::parse(&server.inner.handle_search(&request).unwrap()).unwrap();
        assert!(!response.found);
        assert!(response.ids.is_empty());
    }

    #[test]
    fn panicking_source_is_isolated() {
        let server = local_server();
        server.add_source("broken", Arc::new(Panicker), 0).unwrap();
        server.add_source("working", Arc::new(ClaimOne("pv")), 1).unwrap();

        let request = SearchRequest {
            search_id: 8,
            must_reply: false,
            unicast: false,
            reply_port: 0,
            names: vec![(4, "pv".to_string())],
        };
        let response =
            SearchResponse::parse(&server.inner.handle_search(&request).unwrap()).unwrap();
        assert_eq!(response.ids, vec![4]);
    }

    #[test]
    fn builtin_server_source_claims() {
        let server = local_server();
        let request = SearchRequest {
            search_id: 1,
            must_reply: false,
            unicast: false,
            reply_port: 0,
            names: vec![(3, "server".to_string())],
        };
        let response =
            SearchResponse::parse(&server.inner.handle_search(&request).unwrap()).unwrap();
        assert_eq!(response.ids, vec![3]);
    }

    #[test]
    fn config_from_env() {
        // SAFETY: no other thread in the test binary reads these variables
        unsafe {
            std::env::set_var("EPICS_PVAS_INTF_ADDR_LIST", "127.0.0.1 bogus");
            std::env::set_var("EPICS_PVAS_BEACON_ADDR_LIST", "127.0.0.255");
            std::env::set_var("EPICS_PVA_ADDR_LIST", "10.0.0.255");
            std::env::set_var("EPICS_PVAS_AUTO_BEACON_ADDR_LIST", "no");
            std::env::set_var("EPICS_PVAS_SERVER_PORT", "12345");
            std::env::set_var("EPICS_PVA_SERVER_PORT", "54321");
            std::env::set_var("EPICS_PVAS_BROADCAST_PORT", "not-a-port");
        }
        let conf = Config::from_env();
        unsafe {
            std::env::remove_var("EPICS_PVAS_INTF_ADDR_LIST");
            std::env::remove_var("EPICS_PVAS_BEACON_ADDR_LIST");
            std::env::remove_var("EPICS_PVA_ADDR_LIST");
            std::env::remove_var("EPICS_PVAS_AUTO_BEACON_ADDR_LIST");
            std::env::remove_var("EPICS_PVAS_SERVER_PORT");
            std::env::remove_var("EPICS_PVA_SERVER_PORT");
            std::env::remove_var("EPICS_PVAS_BROADCAST_PORT");
        }

        assert_eq!(conf.interfaces, vec!["127.0.0.1"]);
        // the PVAS variable wins over the PVA fallback
        assert_eq!(conf.beacon_destinations, vec!["127.0.0.255"]);
        assert!(!conf.auto_beacon);
        assert_eq!(conf.tcp_port, 12345);
        // invalid integer falls back to the default
        assert_eq!(conf.udp_port, DEFAULT_UDP_PORT);
    }
}
