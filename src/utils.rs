use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
};
use tracing::error;

/// First environment variable of `names` that is set, with its value.
pub(crate) fn pick_env(names: &[&'static str]) -> Option<(&'static str, String)> {
    names
        .iter()
        .find_map(|name| env::var(name).ok().map(|value| (*name, value)))
}

/// Split a whitespace-separated address list, dropping entries that do not
/// parse as an IPv4 address (with optional `:port`).
pub(crate) fn split_addr_list(name: &str, value: &str) -> Vec<String> {
    value
        .split_ascii_whitespace()
        .filter_map(|token| {
            let valid = if token.contains(':') {
                token.parse::<SocketAddrV4>().is_ok()
            } else {
                token.parse::<Ipv4Addr>().is_ok()
            };
            if valid {
                Some(token.to_string())
            } else {
                error!("{name} ignoring invalid '{token}'");
                None
            }
        })
        .collect()
}

/// Case-insensitive YES/NO; anything else logs an error and keeps the default.
pub(crate) fn parse_yes_no(name: &str, value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("YES") {
        Some(true)
    } else if value.eq_ignore_ascii_case("NO") {
        Some(false)
    } else {
        error!("{name} invalid bool value (YES/NO)");
        None
    }
}

pub(crate) fn parse_port(name: &str, value: &str) -> Option<u16> {
    match value.parse::<u16>() {
        Ok(port) => Some(port),
        Err(e) => {
            error!("{name} invalid integer : {e}");
            None
        }
    }
}

/// A nonblocking UDP socket with port reuse, so several servers can share
/// the search port on one host.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(
    address: T,
) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::other("address resolved to nothing"))?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Broadcast addresses reachable from `bind`: everything non-loopback for
/// the wildcard, otherwise only the interfaces owning that address.
pub(crate) fn broadcast_addrs_for(bind: Ipv4Addr) -> Vec<Ipv4Addr> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter(|iface| {
            bind.is_unspecified() || iface.ips.iter().any(|net| net.ip() == IpAddr::V4(bind))
        })
        .flat_map(|iface| iface.ips.into_iter())
        .filter_map(|net| match (net.ip(), net.broadcast()) {
            (IpAddr::V4(_), IpAddr::V4(broadcast)) => Some(broadcast),
            _ => None,
        })
        .collect()
}

/// The first non-loopback IPv4 address of this host.
pub(crate) fn primary_local_ipv4() -> Option<Ipv4Addr> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .flat_map(|iface| iface.ips.into_iter())
        .find_map(|net| match net.ip() {
            IpAddr::V4(addr) => Some(addr),
            _ => None,
        })
}

/// Resolve a beacon destination entry, falling back to `default_port`.
pub(crate) fn parse_beacon_dest(entry: &str, default_port: u16) -> Option<SocketAddr> {
    if entry.contains(':') {
        entry.parse::<SocketAddrV4>().ok().map(SocketAddr::V4)
    } else {
        entry
            .parse::<Ipv4Addr>()
            .ok()
            .map(|addr| (addr, default_port).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_list_splitting() {
        let parsed = split_addr_list("TEST", " 10.0.0.1  not-an-ip 10.0.0.2:5076 300.1.1.1 ");
        assert_eq!(parsed, vec!["10.0.0.1", "10.0.0.2:5076"]);
    }

    #[test]
    fn yes_no_parsing() {
        assert_eq!(parse_yes_no("TEST", "YES"), Some(true));
        assert_eq!(parse_yes_no("TEST", "no"), Some(false));
        assert_eq!(parse_yes_no("TEST", "maybe"), None);
    }

    #[test]
    fn port_parsing() {
        assert_eq!(parse_port("TEST", "5076"), Some(5076));
        assert_eq!(parse_port("TEST", "70000"), None);
        assert_eq!(parse_port("TEST", "abc"), None);
    }

    #[test]
    fn beacon_dest_parsing() {
        assert_eq!(
            parse_beacon_dest("127.0.0.1", 5076),
            Some("127.0.0.1:5076".parse().unwrap())
        );
        assert_eq!(
            parse_beacon_dest("127.0.0.1:9999", 5076),
            Some("127.0.0.1:9999".parse().unwrap())
        );
        assert_eq!(parse_beacon_dest("nope", 5076), None);
    }

    #[test]
    fn reusable_socket_binds_twice() {
        let first = new_reusable_udp_socket("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let _second = new_reusable_udp_socket(format!("127.0.0.1:{port}")).unwrap();
    }
}
