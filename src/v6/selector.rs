use std::sync::Arc;

use tracing::debug;

use crate::config::{Config, Subnet6};
use crate::packet::Packet;

/// Pick at most one configured subnet for an incoming packet. First match
/// wins; ties fall to configuration order.
///
/// Relayed traffic is matched on the relay's annotations: an interface-id
/// carried by any envelope beats the topological link-address. Direct
/// traffic is matched on the ingress interface, then on a global source
/// address falling inside a subnet, and finally a link-local source picks
/// the sole configured subnet - with several subnets a link-local source
/// is ambiguous and nothing is selected.
pub fn select_subnet(config: &Config, pkt: &Packet) -> Option<Arc<Subnet6>> {
    if !pkt.relay.is_empty() {
        return select_for_relayed(config, pkt);
    }

    if let Some(iface) = &pkt.iface {
        if let Some(subnet) = config
            .subnets()
            .iter()
            .find(|subnet| subnet.interface.as_ref() == Some(iface))
        {
            debug!(iface = %iface, subnet = %subnet.prefix, "subnet selected by interface");
            return Some(Arc::clone(subnet));
        }
    }

    if !pkt.from_link_local() && !pkt.remote_addr.is_unspecified() {
        if let Some(subnet) = config
            .subnets()
            .iter()
            .find(|subnet| subnet.in_range(pkt.remote_addr))
        {
            debug!(remote = %pkt.remote_addr, subnet = %subnet.prefix, "subnet selected by source address");
            return Some(Arc::clone(subnet));
        }
        return None;
    }

    if pkt.from_link_local() {
        if let [subnet] = config.subnets() {
            if subnet.interface.is_none() {
                return Some(Arc::clone(subnet));
            }
        }
    }

    None
}

fn select_for_relayed(config: &Config, pkt: &Packet) -> Option<Arc<Subnet6>> {
    for env in &pkt.relay {
        let Some(iface_id) = env.interface_id() else {
            continue;
        };
        if let Some(subnet) = config
            .subnets()
            .iter()
            .find(|subnet| subnet.interface_id.as_deref() == Some(iface_id))
        {
            debug!(subnet = %subnet.prefix, "subnet selected by relay interface-id");
            return Some(Arc::clone(subnet));
        }
    }

    let link_addr = pkt
        .relay
        .iter()
        .map(|env| env.link_addr)
        .find(|addr| !addr.is_unspecified())?;

    let subnet = config
        .subnets()
        .iter()
        .find(|subnet| subnet.in_range(link_addr))?;
    debug!(link = %link_addr, subnet = %subnet.prefix, "subnet selected by relay link-address");
    Some(Arc::clone(subnet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pool, PoolKind, Subnet6};
    use crate::options::{DhcpOption, DhcpOptions};
    use crate::packet::{MessageType, RelayEnvelope};
    use std::net::Ipv6Addr;

    fn subnet(prefix: &str) -> Subnet6 {
        let prefix = prefix.parse().unwrap();
        let mut subnet = Subnet6::new(prefix, 1, 2, 3, 4);
        subnet
            .add_pool(Pool::from_prefix(PoolKind::Ia, prefix))
            .unwrap();
        subnet
    }

    fn three_subnets() -> Config {
        let mut config = Config::new();
        config.add_subnet(subnet("2001:db8:1::/48"));
        config.add_subnet(subnet("2001:db8:2::/48"));
        config.add_subnet(subnet("2001:db8:3::/48"));
        config
    }

    fn solicit_from(remote: &str) -> Packet {
        let mut pkt = Packet::with_transid(MessageType::Solicit, 1234);
        pkt.remote_addr = remote.parse().unwrap();
        pkt
    }

    fn relayed(link_addr: &str, opts: DhcpOptions) -> Packet {
        let mut pkt = Packet::with_transid(MessageType::Solicit, 1234);
        pkt.relay.push(RelayEnvelope {
            hop_count: 0,
            link_addr: link_addr.parse().unwrap(),
            peer_addr: "fe80::1".parse().unwrap(),
            opts,
        });
        pkt
    }

    #[test]
    fn single_subnet_matches_link_local_traffic() {
        let mut config = Config::new();
        config.add_subnet(subnet("2001:db8:1::/48"));

        let selected = select_subnet(&config, &solicit_from("fe80::abcd")).unwrap();
        assert_eq!(selected.id, 1);
    }

    #[test]
    fn link_local_traffic_is_ambiguous_with_many_subnets() {
        let config = three_subnets();
        assert!(select_subnet(&config, &solicit_from("fe80::abcd")).is_none());
    }

    #[test]
    fn global_source_address_selects_the_containing_subnet() {
        let config = three_subnets();
        let selected = select_subnet(&config, &solicit_from("2001:db8:2::baca")).unwrap();
        assert_eq!(selected.prefix, "2001:db8:2::/48".parse().unwrap());

        assert!(select_subnet(&config, &solicit_from("2001:db8:4::baca")).is_none());
    }

    #[test]
    fn ingress_interface_beats_everything_direct() {
        let mut config = Config::new();
        let mut s1 = subnet("2001:db8:1::/48");
        s1.interface = Some("eth0".into());
        config.add_subnet(s1);
        config.add_subnet(subnet("2001:db8:2::/48"));
        let mut s3 = subnet("2001:db8:3::/48");
        s3.interface = Some("wifi1".into());
        config.add_subnet(s3);

        let mut pkt = solicit_from("fe80::abcd");
        pkt.iface = Some("eth0".into());
        assert_eq!(select_subnet(&config, &pkt).unwrap().id, 1);

        pkt.iface = Some("wifi1".into());
        assert_eq!(select_subnet(&config, &pkt).unwrap().id, 3);

        pkt.iface = Some("eth3".into());
        assert!(select_subnet(&config, &pkt).is_none());
    }

    #[test]
    fn interface_constrained_single_subnet_needs_a_matching_interface() {
        let mut config = Config::new();
        let mut s1 = subnet("2001:db8:1::/48");
        s1.interface = Some("eth0".into());
        config.add_subnet(s1);

        let mut pkt = solicit_from("fe80::abcd");
        pkt.iface = Some("eth1".into());
        assert!(select_subnet(&config, &pkt).is_none());
    }

    #[test]
    fn relay_link_address_selects_subnet() {
        let config = three_subnets();
        let pkt = relayed("2001:db8:2::1234", DhcpOptions::new());
        let selected = select_subnet(&config, &pkt).unwrap();
        assert_eq!(selected.prefix, "2001:db8:2::/48".parse().unwrap());
    }

    #[test]
    fn relayed_traffic_never_falls_back_to_source_address() {
        let mut config = Config::new();
        config.add_subnet(subnet("2001:db8:1::/48"));

        // relayed from a link not covered by any subnet
        let mut pkt = relayed("2001:db8:4::1234", DhcpOptions::new());
        pkt.remote_addr = "2001:db8:1::baca".parse().unwrap();
        assert!(select_subnet(&config, &pkt).is_none());
    }

    #[test]
    fn relay_interface_id_beats_link_address() {
        let mut config = Config::new();
        let mut s1 = subnet("2001:db8:1::/48");
        s1.interface_id = Some(b"relay1".to_vec());
        config.add_subnet(s1);
        let mut s2 = subnet("2001:db8:2::/48");
        s2.interface_id = Some(b"relay2".to_vec());
        config.add_subnet(s2);
        config.add_subnet(subnet("2001:db8:3::/48"));

        let mut opts = DhcpOptions::new();
        opts.insert(DhcpOption::InterfaceId(b"relay2".to_vec()));
        // link-address points into subnet 3, but the interface-id wins
        let pkt = relayed("2001:db8:3::1234", opts);
        assert_eq!(select_subnet(&config, &pkt).unwrap().id, 2);
    }

    #[test]
    fn unknown_relay_interface_id_selects_nothing_without_link_match() {
        let mut config = Config::new();
        let mut s1 = subnet("2001:db8:1::/48");
        s1.interface_id = Some(b"relay1".to_vec());
        config.add_subnet(s1);

        let mut opts = DhcpOptions::new();
        opts.insert(DhcpOption::InterfaceId(b"relay2".to_vec()));
        let pkt = relayed("2001:db8:2::1234", opts);
        assert!(select_subnet(&config, &pkt).is_none());
    }

    #[test]
    fn outermost_non_unspecified_link_address_wins() {
        let config = three_subnets();
        let mut pkt = relayed("::", DhcpOptions::new());
        // inner envelope carries the usable link-address
        pkt.relay.push(RelayEnvelope {
            hop_count: 1,
            link_addr: "2001:db8:3::1".parse().unwrap(),
            peer_addr: Ipv6Addr::UNSPECIFIED,
            opts: DhcpOptions::new(),
        });
        let selected = select_subnet(&config, &pkt).unwrap();
        assert_eq!(selected.prefix, "2001:db8:3::/48".parse().unwrap());
    }
}
