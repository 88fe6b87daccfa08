use std::{fmt, sync::Arc};

use tracing::{debug, field, info, instrument, Span};

use crate::alloc;
use crate::config::{Config, Subnet6};
use crate::duid::Duid;
use crate::hooks::{CalloutHandle, HookPoint, HooksRegistry};
use crate::leasedb::LeaseStore;
use crate::options::{DhcpOption, DhcpOptions, IaAddr, IaNa, OptionCode, Status, StatusCode};
use crate::packet::{MessageType, Packet};
use crate::v6::selector;

/// Everything the processors need besides the configuration: the lease
/// store, the server's identity, and the registered callouts. Passed
/// explicitly so tests drive the processors directly.
pub struct Server6 {
    pub leases: Arc<dyn LeaseStore>,
    pub server_id: Duid,
    pub hooks: HooksRegistry,
}

impl Server6 {
    pub fn new(leases: Arc<dyn LeaseStore>, server_id: Duid) -> Self {
        Server6 {
            leases,
            server_id,
            hooks: HooksRegistry::new(),
        }
    }
}

/// Outcome of processing one message: a reply to emit, or a deliberate
/// silence (malformed and policy-violating requests are dropped without a
/// response to avoid amplification).
pub enum V6Response {
    Reply(Packet),
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RfcViolation,
    NoClientId,
    UnhandledMessageType,
    SkippedByCallout,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::RfcViolation => "RfcViolation",
            DropReason::NoClientId => "NoClientId",
            DropReason::UnhandledMessageType => "UnhandledMessageType",
            DropReason::SkippedByCallout => "SkippedByCallout",
        }
    }
}

/// Presence policy for the client-id / server-id options, per message
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionPolicy {
    Mandatory,
    Optional,
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcViolation {
    pub option: &'static str,
    pub problem: &'static str,
}

impl fmt::Display for RfcViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.option, self.problem)
    }
}

impl std::error::Error for RfcViolation {}

/// Verify option cardinality before a processor runs. Both identifiers
/// may appear at most once regardless of policy.
pub fn sanity_check(
    pkt: &Packet,
    clientid: OptionPolicy,
    serverid: OptionPolicy,
) -> Result<(), RfcViolation> {
    check_cardinality(pkt, OptionCode::ClientId, clientid, "client-id")?;
    check_cardinality(pkt, OptionCode::ServerId, serverid, "server-id")
}

fn check_cardinality(
    pkt: &Packet,
    code: OptionCode,
    policy: OptionPolicy,
    option: &'static str,
) -> Result<(), RfcViolation> {
    let count = pkt.opts.count(code);
    if count > 1 {
        return Err(RfcViolation {
            option,
            problem: "appears more than once",
        });
    }
    match (policy, count) {
        (OptionPolicy::Mandatory, 0) => Err(RfcViolation {
            option,
            problem: "is mandatory but missing",
        }),
        (OptionPolicy::Forbidden, 1) => Err(RfcViolation {
            option,
            problem: "is forbidden in this message",
        }),
        _ => Ok(()),
    }
}

/// Dispatch a decoded message to its processor. Sanity policies follow
/// RFC 3315 section 15: SOLICIT forbids a server-id, the three stateful
/// follow-ups require both identifiers.
pub fn handle_message(srv: &Server6, config: &Config, pkt: &mut Packet) -> V6Response {
    let policies = match pkt.msg_type {
        MessageType::Solicit => (OptionPolicy::Mandatory, OptionPolicy::Forbidden),
        MessageType::Request | MessageType::Renew | MessageType::Release => {
            (OptionPolicy::Mandatory, OptionPolicy::Mandatory)
        }
        MessageType::InformationRequest => (OptionPolicy::Optional, OptionPolicy::Optional),
        other => {
            debug!(msg_type = ?other, "message type not processed");
            return V6Response::Drop(DropReason::UnhandledMessageType);
        }
    };

    if let Err(violation) = sanity_check(pkt, policies.0, policies.1) {
        info!(%violation, msg_type = ?pkt.msg_type, "dropping packet");
        return V6Response::Drop(DropReason::RfcViolation);
    }

    match pkt.msg_type {
        MessageType::Solicit => process_solicit(srv, config, pkt),
        MessageType::Request => process_request(srv, config, pkt),
        MessageType::Renew => process_renew(srv, config, pkt),
        MessageType::Release => process_release(srv, config, pkt),
        // sanity-checked above; full information-request processing is a
        // stateless exchange this server does not offer
        MessageType::InformationRequest => {
            V6Response::Drop(DropReason::UnhandledMessageType)
        }
        _ => unreachable!("filtered by the policy match"),
    }
}

/// Run the selector and give `subnet6_select` callouts a chance to
/// substitute a subnet from the collection or to skip the packet.
fn select_subnet(
    srv: &Server6,
    config: &Config,
    pkt: &mut Packet,
) -> Result<Option<Arc<Subnet6>>, DropReason> {
    let selected = selector::select_subnet(config, pkt);

    if !srv.hooks.has_callouts(HookPoint::Subnet6Select) {
        return Ok(selected);
    }

    let collection = config.subnets().to_vec();
    let mut handle = CalloutHandle::for_subnet_select(pkt, selected, collection);
    srv.hooks.invoke(HookPoint::Subnet6Select, &mut handle);
    if handle.skip() {
        return Err(DropReason::SkippedByCallout);
    }
    Ok(handle.subnet6.clone())
}

fn record_client_id(duid: &Duid) {
    Span::current().record("client_id", field::display(duid.to_colon_string()));
}

/// IA_NA carrying a freshly assigned or refreshed address with the
/// subnet's timers.
fn ia_with_address(iaid: u32, subnet: &Subnet6, addr: std::net::Ipv6Addr) -> DhcpOption {
    let mut opts = DhcpOptions::new();
    opts.insert(DhcpOption::IaAddr(IaAddr {
        addr,
        preferred_lifetime: subnet.preferred_lifetime,
        valid_lifetime: subnet.valid_lifetime,
        opts: DhcpOptions::new(),
    }));
    DhcpOption::IaNa(IaNa {
        iaid,
        t1: subnet.t1,
        t2: subnet.t2,
        opts,
    })
}

/// IA_NA carrying a failure status. T1 and T2 are zeroed and no
/// IA-address is attached, matching the status-code symmetry rule.
fn ia_with_status(iaid: u32, status: Status, text: &str) -> DhcpOption {
    let mut opts = DhcpOptions::new();
    opts.insert(DhcpOption::StatusCode(StatusCode::new(status, text)));
    DhcpOption::IaNa(IaNa {
        iaid,
        t1: 0,
        t2: 0,
        opts,
    })
}

/// IA_NA confirming a successful release: no address, no status (success
/// is the default reading).
fn ia_released(iaid: u32) -> DhcpOption {
    DhcpOption::IaNa(IaNa {
        iaid,
        t1: 0,
        t2: 0,
        opts: DhcpOptions::new(),
    })
}

/// First IA-address inside an IA_NA, used as the client's hint.
fn ia_hint(ia: &IaNa) -> Option<std::net::Ipv6Addr> {
    ia.opts.iter().find_map(|opt| match opt {
        DhcpOption::IaAddr(addr) => Some(addr.addr),
        _ => None,
    })
}

/// Append the configured options the client asked for in its ORO.
fn append_requested_options(reply: &mut Packet, subnet: &Subnet6, requested: Option<&[u16]>) {
    let Some(requested) = requested else {
        return;
    };
    for code in requested {
        if let Some(opt) = subnet.option_for(*code) {
            reply.opts.insert(opt.clone());
        }
    }
}

fn finish_reply(reply: &mut Packet, client_id: &[u8], server_id: &Duid) {
    reply.opts.insert(DhcpOption::ServerId(server_id.bytes.clone()));
    reply.opts.insert(DhcpOption::ClientId(client_id.to_vec()));
}

/// SOLICIT -> ADVERTISE. Addresses are computed but never persisted; the
/// client comes back with a REQUEST to commit one.
#[instrument(skip(srv, config, pkt), fields(client_id = field::Empty, xid = pkt.transid()))]
pub fn process_solicit(srv: &Server6, config: &Config, pkt: &mut Packet) -> V6Response {
    let Some(client_id) = pkt.client_id().map(<[u8]>::to_vec) else {
        return V6Response::Drop(DropReason::NoClientId);
    };
    let duid = Duid::from(client_id.clone());
    record_client_id(&duid);

    let subnet = match select_subnet(srv, config, pkt) {
        Ok(subnet) => subnet,
        Err(reason) => return V6Response::Drop(reason),
    };

    let mut reply = pkt.reply_to(MessageType::Advertise);

    for ia in pkt.ia_nas() {
        let assigned = subnet.as_deref().and_then(|subnet| {
            alloc::allocate(&*srv.leases, subnet, &duid, ia.iaid, ia_hint(ia), false).ok()
        });
        match (assigned, subnet.as_deref()) {
            (Some(lease), Some(subnet)) => {
                reply
                    .opts
                    .insert(ia_with_address(ia.iaid, subnet, lease.addr));
            }
            _ => {
                debug!(iaid = ia.iaid, "no address to advertise");
                reply.opts.insert(ia_with_status(
                    ia.iaid,
                    Status::NoAddrsAvail,
                    "no addresses available on this link",
                ));
            }
        }
    }

    if let Some(subnet) = subnet.as_deref() {
        append_requested_options(&mut reply, subnet, pkt.oro());
    }
    finish_reply(&mut reply, &client_id, &srv.server_id);
    V6Response::Reply(reply)
}

/// REQUEST -> REPLY. Like SOLICIT, but successful allocations are written
/// to the lease store.
#[instrument(skip(srv, config, pkt), fields(client_id = field::Empty, xid = pkt.transid()))]
pub fn process_request(srv: &Server6, config: &Config, pkt: &mut Packet) -> V6Response {
    let Some(client_id) = pkt.client_id().map(<[u8]>::to_vec) else {
        return V6Response::Drop(DropReason::NoClientId);
    };
    let duid = Duid::from(client_id.clone());
    record_client_id(&duid);

    let subnet = match select_subnet(srv, config, pkt) {
        Ok(subnet) => subnet,
        Err(reason) => return V6Response::Drop(reason),
    };

    let mut reply = pkt.reply_to(MessageType::Reply);

    for ia in pkt.ia_nas() {
        let assigned = subnet.as_deref().and_then(|subnet| {
            match alloc::allocate(&*srv.leases, subnet, &duid, ia.iaid, ia_hint(ia), true) {
                Ok(lease) => Some(lease),
                Err(err) => {
                    info!(iaid = ia.iaid, %err, "address assignment failed");
                    None
                }
            }
        });
        match (assigned, subnet.as_deref()) {
            (Some(lease), Some(subnet)) => {
                info!(iaid = ia.iaid, addr = %lease.addr, "address assigned");
                reply
                    .opts
                    .insert(ia_with_address(ia.iaid, subnet, lease.addr));
            }
            _ => {
                reply.opts.insert(ia_with_status(
                    ia.iaid,
                    Status::NoAddrsAvail,
                    "no addresses available on this link",
                ));
            }
        }
    }

    if let Some(subnet) = subnet.as_deref() {
        append_requested_options(&mut reply, subnet, pkt.oro());
    }
    finish_reply(&mut reply, &client_id, &srv.server_id);
    V6Response::Reply(reply)
}

/// RENEW -> REPLY. The stored binding is authoritative; a missing one is
/// reported per IA as NoBinding with zeroed timers.
#[instrument(skip(srv, config, pkt), fields(client_id = field::Empty, xid = pkt.transid()))]
pub fn process_renew(srv: &Server6, config: &Config, pkt: &mut Packet) -> V6Response {
    let Some(client_id) = pkt.client_id().map(<[u8]>::to_vec) else {
        return V6Response::Drop(DropReason::NoClientId);
    };
    let duid = Duid::from(client_id.clone());
    record_client_id(&duid);

    let subnet = match select_subnet(srv, config, pkt) {
        Ok(subnet) => subnet,
        Err(reason) => return V6Response::Drop(reason),
    };

    let mut reply = pkt.reply_to(MessageType::Reply);

    for ia in pkt.ia_nas() {
        let renewed = subnet.as_deref().and_then(|subnet| {
            alloc::renew(&*srv.leases, subnet, &duid, ia.iaid, ia_hint(ia)).ok()
        });
        match (renewed, subnet.as_deref()) {
            (Some(lease), Some(subnet)) => {
                info!(iaid = ia.iaid, addr = %lease.addr, "lease renewed");
                reply
                    .opts
                    .insert(ia_with_address(ia.iaid, subnet, lease.addr));
            }
            _ => {
                debug!(iaid = ia.iaid, "nothing to renew");
                reply.opts.insert(ia_with_status(
                    ia.iaid,
                    Status::NoBinding,
                    "no binding for this IA",
                ));
            }
        }
    }

    finish_reply(&mut reply, &client_id, &srv.server_id);
    V6Response::Reply(reply)
}

/// RELEASE -> REPLY. Per RFC 3315 section 18.2.6 the reply's IA_NA never
/// carries an IA-address. Message-level status is Success when at least
/// one address was released, NoBinding when none were.
#[instrument(skip(srv, _config, pkt), fields(client_id = field::Empty, xid = pkt.transid()))]
pub fn process_release(srv: &Server6, _config: &Config, pkt: &mut Packet) -> V6Response {
    let Some(client_id) = pkt.client_id().map(<[u8]>::to_vec) else {
        return V6Response::Drop(DropReason::NoClientId);
    };
    let duid = Duid::from(client_id.clone());
    record_client_id(&duid);

    let mut reply = pkt.reply_to(MessageType::Reply);
    let mut any_released = false;

    for ia in pkt.ia_nas() {
        let addrs: Vec<_> = ia
            .opts
            .iter()
            .filter_map(|opt| match opt {
                DhcpOption::IaAddr(addr) => Some(addr.addr),
                _ => None,
            })
            .collect();

        let mut ia_ok = !addrs.is_empty();
        for addr in addrs {
            match alloc::release(&*srv.leases, &duid, ia.iaid, addr) {
                Ok(()) => {
                    info!(iaid = ia.iaid, %addr, "lease released");
                    any_released = true;
                }
                Err(err) => {
                    info!(iaid = ia.iaid, %addr, %err, "release refused");
                    ia_ok = false;
                }
            }
        }

        if ia_ok {
            reply.opts.insert(ia_released(ia.iaid));
        } else {
            reply.opts.insert(ia_with_status(
                ia.iaid,
                Status::NoBinding,
                "no binding for this IA",
            ));
        }
    }

    if !any_released {
        reply.opts.insert(DhcpOption::StatusCode(StatusCode::new(
            Status::NoBinding,
            "no leases to release",
        )));
    }

    finish_reply(&mut reply, &client_id, &srv.server_id);
    V6Response::Reply(reply)
}

impl fmt::Debug for V6Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            V6Response::Reply(pkt) => write!(f, "Reply({:?})", pkt.msg_type),
            V6Response::Drop(reason) => write!(f, "Drop({})", reason.as_str()),
        }
    }
}
