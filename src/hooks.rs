use std::sync::Arc;

use crate::config::Subnet6;
use crate::packet::Packet;

/// The processing stages external callouts can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After decode, before dispatch.
    Pkt6Receive,
    /// After the selector ran, with the chosen subnet and the collection.
    Subnet6Select,
    /// After a response is assembled, before emit.
    Pkt6Send,
}

impl HookPoint {
    pub fn name(self) -> &'static str {
        match self {
            HookPoint::Pkt6Receive => "pkt6_receive",
            HookPoint::Subnet6Select => "subnet6_select",
            HookPoint::Pkt6Send => "pkt6_send",
        }
    }
}

/// Argument bag handed to callouts. Named fields instead of a string-keyed
/// map; `subnet6`/`subnet6_collection` are only populated on
/// `subnet6_select`, where a callout may substitute any collection member
/// back into `subnet6`.
pub struct CalloutHandle<'a> {
    pub pkt6: &'a mut Packet,
    pub subnet6: Option<Arc<Subnet6>>,
    pub subnet6_collection: Vec<Arc<Subnet6>>,
    skip: bool,
}

impl<'a> CalloutHandle<'a> {
    pub fn for_packet(pkt6: &'a mut Packet) -> Self {
        CalloutHandle {
            pkt6,
            subnet6: None,
            subnet6_collection: Vec::new(),
            skip: false,
        }
    }

    pub fn for_subnet_select(
        pkt6: &'a mut Packet,
        subnet6: Option<Arc<Subnet6>>,
        subnet6_collection: Vec<Arc<Subnet6>>,
    ) -> Self {
        CalloutHandle {
            pkt6,
            subnet6,
            subnet6_collection,
            skip: false,
        }
    }

    /// Ask the server to stop processing this packet at the current stage.
    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    pub fn skip(&self) -> bool {
        self.skip
    }
}

pub type Callout = Box<dyn Fn(&mut CalloutHandle<'_>) + Send + Sync>;

/// Callouts keyed by hook point, executed in registration order. Each
/// callout observes the mutations of the ones before it; return values are
/// the handle's fields and the skip flag, nothing else.
#[derive(Default)]
pub struct HooksRegistry {
    pkt6_receive: Vec<Callout>,
    subnet6_select: Vec<Callout>,
    pkt6_send: Vec<Callout>,
}

impl HooksRegistry {
    pub fn new() -> Self {
        HooksRegistry::default()
    }

    pub fn register(&mut self, point: HookPoint, callout: Callout) {
        self.callouts_mut(point).push(callout);
    }

    pub fn has_callouts(&self, point: HookPoint) -> bool {
        !self.callouts(point).is_empty()
    }

    /// Run every callout for `point` over the handle. The skip flag is
    /// left for the caller to act on; later callouts still run after it is
    /// set, as they may want to observe or reverse it.
    pub fn invoke(&self, point: HookPoint, handle: &mut CalloutHandle<'_>) {
        for callout in self.callouts(point) {
            callout(handle);
        }
    }

    fn callouts(&self, point: HookPoint) -> &[Callout] {
        match point {
            HookPoint::Pkt6Receive => &self.pkt6_receive,
            HookPoint::Subnet6Select => &self.subnet6_select,
            HookPoint::Pkt6Send => &self.pkt6_send,
        }
    }

    fn callouts_mut(&mut self, point: HookPoint) -> &mut Vec<Callout> {
        match point {
            HookPoint::Pkt6Receive => &mut self.pkt6_receive,
            HookPoint::Subnet6Select => &mut self.subnet6_select,
            HookPoint::Pkt6Send => &mut self.pkt6_send,
        }
    }
}
