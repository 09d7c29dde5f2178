#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

/*! Traction control routing.

Throttle semantics live in the application: this service decodes the
command family, forwards it to the injected [`TrainControl`], and turns
query answers into reply messages. The heartbeat hook is driven from
the 100 ms tick.
*/

use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::Node;
use openlcb_defs::{error, Mti};

/// Traction command bytes (first payload octet).
pub mod command {
    pub const SET_SPEED: u8 = 0x00;
    pub const SET_FUNCTION: u8 = 0x01;
    pub const EMERGENCY_STOP: u8 = 0x02;
    pub const QUERY_SPEED: u8 = 0x10;
    pub const QUERY_FUNCTION: u8 = 0x11;
    pub const CONTROLLER_CONFIG: u8 = 0x20;
    pub const MANAGEMENT: u8 = 0x40;
}

/// What the application's train layer must provide.
///
/// Speed values are the raw half-precision wire encoding; the core
/// neither interprets nor converts them.
pub trait TrainControl {
    fn set_speed(&mut self, node: &mut Node, speed: u16);
    fn set_function(&mut self, node: &mut Node, address: u32, value: u16);
    fn emergency_stop(&mut self, node: &mut Node);
    fn speed(&self, node: &Node) -> u16;
    fn function(&self, node: &Node, address: u32) -> u16;
    /// Called every 100 ms while the node runs; the implementation
    /// decides when silence from the controller means stop.
    fn heartbeat_tick(&mut self, node: &mut Node);
}

/// The traction protocol handler.
#[derive(Default)]
pub struct Service;

impl Service {
    pub fn new() -> Self {
        Self
    }

    /// Route one traction command to the train layer. Without a train
    /// layer every command is rejected as unimplemented.
    pub fn handle_command(
        &mut self,
        node: &mut Node,
        pool: &mut Pool,
        train: Option<&mut dyn TrainControl>,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id, first) = {
            let msg = pool.get(incoming);
            (
                msg.source_alias,
                msg.source_id,
                msg.payload.as_slice().first().copied(),
            )
        };
        let Some(command) = first else {
            return;
        };

        let Some(train) = train else {
            let Some(handle) = allocate_reply(
                pool,
                node,
                peer_alias,
                peer_id,
                PayloadClass::Basic,
                Mti::OptionalInteractionRejected,
            ) else {
                return;
            };
            let msg = pool.get_mut(handle);
            msg.set_word(0, error::NOT_IMPLEMENTED).unwrap();
            msg.set_word(2, u16::from(Mti::TractionControlCommand)).unwrap();
            out.set(handle);
            return;
        };

        match command {
            command::SET_SPEED => {
                let speed = {
                    let msg = pool.get(incoming);
                    if msg.payload.len() < 3 {
                        return;
                    }
                    msg.word_at(1)
                };
                train.set_speed(node, speed);
            }
            command::SET_FUNCTION => {
                let (address, value) = {
                    let msg = pool.get(incoming);
                    if msg.payload.len() < 6 {
                        return;
                    }
                    let address = (u32::from(msg.byte_at(1)) << 16)
                        | (u32::from(msg.byte_at(2)) << 8)
                        | u32::from(msg.byte_at(3));
                    (address, msg.word_at(4))
                };
                train.set_function(node, address, value);
            }
            command::EMERGENCY_STOP => train.emergency_stop(node),
            command::QUERY_SPEED => {
                let speed = train.speed(node);
                let Some(handle) = allocate_reply(
                    pool,
                    node,
                    peer_alias,
                    peer_id,
                    PayloadClass::Basic,
                    Mti::TractionControlReply,
                ) else {
                    return;
                };
                let msg = pool.get_mut(handle);
                msg.set_byte(0, command::QUERY_SPEED).unwrap();
                msg.set_word(1, speed).unwrap();
                // Status octet, then commanded speed repeated.
                msg.set_byte(3, 0).unwrap();
                msg.set_word(4, speed).unwrap();
                out.set(handle);
            }
            command::QUERY_FUNCTION => {
                let address = {
                    let msg = pool.get(incoming);
                    if msg.payload.len() < 4 {
                        return;
                    }
                    (u32::from(msg.byte_at(1)) << 16)
                        | (u32::from(msg.byte_at(2)) << 8)
                        | u32::from(msg.byte_at(3))
                };
                let value = train.function(node, address);
                let Some(handle) = allocate_reply(
                    pool,
                    node,
                    peer_alias,
                    peer_id,
                    PayloadClass::Basic,
                    Mti::TractionControlReply,
                ) else {
                    return;
                };
                let msg = pool.get_mut(handle);
                msg.set_byte(0, command::QUERY_FUNCTION).unwrap();
                msg.set_byte(1, (address >> 16) as u8).unwrap();
                msg.set_byte(2, (address >> 8) as u8).unwrap();
                msg.set_byte(3, address as u8).unwrap();
                msg.set_word(4, value).unwrap();
                out.set(handle);
            }
            _ => {
                // Controller configuration and management families are
                // application territory; unhandled here.
            }
        }
    }

    /// Replies from other nodes' trains; nothing to do in the core.
    pub fn handle_reply(&mut self, _node: &mut Node, _pool: &mut Pool, _incoming: Handle) {}

    /// The 100 ms tick fans out to the train layer's heartbeat.
    pub fn tick(&mut self, node: &mut Node, train: Option<&mut dyn TrainControl>) {
        if let Some(train) = train {
            train.heartbeat_tick(node);
        }
    }
}
