#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! The node stack delegator.

[`Stack`] owns the buffer pools, the CAN interface, the node set and
one instance of every protocol service, and wires them together: the
interface assembles inbound frames, the dispatcher routes assembled
messages through the services, replies flow back out through the
fragmenter. A 100 ms tick advances login waits, datagram reply-pending
timers and the optional train heartbeat.

The whole stack is single-threaded and cooperative; call [`Stack::poll`]
from the main loop until it reports no further progress, and
[`Stack::tick`] from the timer, under the same pause/resume discipline
the driver uses.
*/

#[cfg(test)]
extern crate alloc;

use managed::ManagedSlice;
use openlcb_core::buffer::{Pool, PoolStats};
use openlcb_core::event::EventId;
use openlcb_core::message::PayloadClass;
use openlcb_core::node::Node;
use openlcb_core::node_id::{Alias, NodeId};
use openlcb_defs::{error, Mti};
use openlcb_network::iface::{Callbacks, Interface};
use openlcb_network::phy::Device;
use openlcb_persistence::ConfigurationStorage;
use openlcb_svc_all::traction::TrainControl;
use openlcb_svc_all::{config, events, mns, stream, traction};

mod dispatch;

use dispatch::DispatchState;

/// One instance of every protocol handler.
pub struct Services {
    pub mns: mns::Service,
    pub events: events::Service,
    pub config: config::Service,
    pub stream: stream::Service,
    pub traction: traction::Service,
}

impl Services {
    fn new() -> Self {
        Self {
            mns: mns::Service::new(),
            events: events::Service::new(),
            config: config::Service::new(),
            stream: stream::Service::new(),
            traction: traction::Service::new(),
        }
    }
}

/// The assembled node stack.
pub struct Stack<'a, S: ConfigurationStorage> {
    nodes: ManagedSlice<'a, Node>,
    pool: Pool,
    iface: Interface,
    storage: S,
    services: Services,
    active: Option<DispatchState>,
}

impl<'a, S: ConfigurationStorage> Stack<'a, S> {
    /// Build a stack over caller-provided node storage and the injected
    /// configuration backend.
    pub fn new<N>(nodes: N, storage: S) -> Self
    where
        N: Into<ManagedSlice<'a, Node>>,
    {
        Self {
            nodes: nodes.into(),
            pool: Pool::new(),
            iface: Interface::new(),
            storage,
            services: Services::new(),
            active: None,
        }
    }

    /// One cooperative pass: frames in, one dispatcher step, frames out.
    pub fn poll<D: Device>(&mut self, device: &mut D) -> bool {
        self.poll_with_train(device, None)
    }

    /// Like [`poll`], with a train layer for traction commands.
    ///
    /// [`poll`]: #method.poll
    pub fn poll_with_train<D: Device>(
        &mut self,
        device: &mut D,
        train: Option<&mut dyn TrainControl>,
    ) -> bool {
        let mut did_something = false;
        did_something |= self
            .iface
            .poll(device, &mut self.pool, &mut self.nodes);
        did_something |= dispatch::dispatch(
            &mut self.nodes,
            &mut self.pool,
            &mut self.iface,
            &mut self.storage,
            &mut self.services,
            &mut self.active,
            train,
        );
        did_something
    }

    /// The 100 ms tick. Advances every node's tick counter and expires
    /// datagrams still waiting for their acknowledgement. Allocates
    /// nothing.
    pub fn tick(&mut self) {
        let Self {
            nodes,
            pool,
            services,
            ..
        } = self;
        for node in nodes.iter_mut() {
            node.timer_ticks = node.timer_ticks.saturating_add(1);
            if let Some(pending) = node.pending_datagram {
                let msg = pool.get_mut(pending);
                msg.timer_ticks = msg.timer_ticks.saturating_add(1);
                if msg.timer_ticks > openlcb_core::config::DATAGRAM_REPLY_PENDING_TICKS {
                    let peer = msg.dest_alias;
                    pool.free(pending);
                    node.pending_datagram = None;
                    node.datagram_resend_count = 0;
                    if let Some(callback) = services.config.on_datagram_failed {
                        callback(peer, error::TIMEOUT);
                    }
                }
            }
        }
    }

    /// The 100 ms tick including the train heartbeat hook.
    pub fn tick_with_train(&mut self, train: &mut dyn TrainControl) {
        self.tick();
        let Self {
            nodes, services, ..
        } = self;
        for node in nodes.iter_mut() {
            services.traction.tick(node, Some(train));
        }
    }

    /// Emit a PC Event Report from `node_index`.
    pub fn produce_event(&mut self, node_index: usize, event: EventId) -> bool {
        self.produce_event_with_payload(node_index, event, &[])
    }

    /// Emit a PC Event Report, with up to 64 payload octets following
    /// the event id.
    pub fn produce_event_with_payload(
        &mut self,
        node_index: usize,
        event: EventId,
        payload: &[u8],
    ) -> bool {
        if payload.len() > 64 {
            return false;
        }
        let Some(node) = self.nodes.get(node_index) else {
            return false;
        };
        if !node.is_permitted() {
            return false;
        }
        let (alias, id) = (node.alias, node.id);

        let (class, mti) = if payload.is_empty() {
            (PayloadClass::Basic, Mti::PcEventReport)
        } else {
            (PayloadClass::Snip, Mti::PcEventReportWithPayload)
        };
        let Some(handle) = self.pool.allocate(class) else {
            return false;
        };
        let msg = self.pool.get_mut(handle);
        msg.load_header(alias, id, Alias::NULL, NodeId::NULL, mti);
        msg.set_event_id(0, event).unwrap();
        if !payload.is_empty() {
            msg.set_bytes(8, payload).unwrap();
        }
        if self.iface.send(handle).is_err() {
            self.pool.free(handle);
            return false;
        }
        true
    }

    /// Stop inbound processing while another context touches shared
    /// buffers, per the driver contract.
    pub fn pause_can_rx(&mut self) {
        self.iface.pause_rx();
    }

    pub fn resume_can_rx(&mut self) {
        self.iface.resume_rx();
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services {
        &mut self.services
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Driver and error hooks on the interface.
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.iface.callbacks
    }

    /// Buffer telemetry for pool sizing.
    pub fn pool_stats(&self, class: PayloadClass) -> PoolStats {
        self.pool.stats(class)
    }

    pub fn clear_pool_telemetry(&mut self) {
        self.pool.clear_max_allocated();
    }
}
