use openlcb_core::buffer::{Handle, Pool};
use openlcb_core::handler::{allocate_reply, OutgoingSlot};
use openlcb_core::message::PayloadClass;
use openlcb_core::node::Node;
use openlcb_defs::{snip, MemorySpace, Mti};
use openlcb_persistence::ConfigurationStorage;

use crate::Service;

// User name and description live in the ACDI user space, behind its
// version octet.
const USER_NAME_OFFSET: u32 = 1;
const USER_DESCRIPTION_OFFSET: u32 = 1 + snip::MAX_USER_NAME as u32;

fn clip(text: &str, limit: usize) -> &str {
    // Reserve one octet for the terminating null.
    let mut end = text.len().min(limit - 1);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn read_user_string<S: ConfigurationStorage>(
    storage: &mut S,
    node: &Node,
    offset: u32,
    buffer: &mut [u8],
) -> usize {
    let count = storage
        .read(node.id, MemorySpace::AcdiUser.into(), offset, buffer)
        .unwrap_or(0);
    let len = buffer[..count]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(count);
    // Unterminated storage still leaves room for the null we append.
    len.min(buffer.len() - 1)
}

impl Service {
    /// Build the SNIP reply: the four manufacturer strings from the
    /// immutable parameters, the two user strings from the configuration
    /// backend.
    pub fn handle_simple_node_info_request<S: ConfigurationStorage>(
        &self,
        node: &mut Node,
        pool: &mut Pool,
        storage: &mut S,
        incoming: Handle,
        out: &mut OutgoingSlot,
    ) {
        let (peer_alias, peer_id) = {
            let msg = pool.get(incoming);
            (msg.source_alias, msg.source_id)
        };

        let mut name = [0u8; snip::MAX_USER_NAME];
        let name_len = read_user_string(storage, node, USER_NAME_OFFSET, &mut name);
        let mut description = [0u8; snip::MAX_USER_DESCRIPTION];
        let description_len =
            read_user_string(storage, node, USER_DESCRIPTION_OFFSET, &mut description);

        let Some(handle) = allocate_reply(
            pool,
            node,
            peer_alias,
            peer_id,
            PayloadClass::Snip,
            Mti::SimpleNodeInfoReply,
        ) else {
            return;
        };
        let ident = node.parameters.snip;
        let msg = pool.get_mut(handle);
        msg.set_byte(0, snip::MANUFACTURER_VERSION).unwrap();
        let mut offset = 1;
        offset += msg
            .set_str(offset, clip(ident.manufacturer, snip::MAX_MANUFACTURER_NAME))
            .unwrap();
        offset += msg
            .set_str(offset, clip(ident.model, snip::MAX_MODEL_NAME))
            .unwrap();
        offset += msg
            .set_str(offset, clip(ident.hardware_version, snip::MAX_HARDWARE_VERSION))
            .unwrap();
        offset += msg
            .set_str(offset, clip(ident.software_version, snip::MAX_SOFTWARE_VERSION))
            .unwrap();
        msg.set_byte(offset, snip::USER_VERSION).unwrap();
        offset += 1;
        msg.set_bytes(offset, &name[..name_len]).unwrap();
        offset += name_len;
        msg.set_byte(offset, 0).unwrap();
        offset += 1;
        msg.set_bytes(offset, &description[..description_len]).unwrap();
        offset += description_len;
        msg.set_byte(offset, 0).unwrap();

        out.set(handle);
    }

    /// A peer's SNIP reply: hand the raw blob to the application.
    pub fn handle_simple_node_info_reply(
        &self,
        _node: &mut Node,
        pool: &mut Pool,
        incoming: Handle,
    ) {
        let msg = pool.get(incoming);
        if let Some(callback) = self.on_simple_node_info {
            callback(msg.source_alias, msg.payload.as_slice());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::{incoming, test_node};
    use openlcb_persistence::RamStorage;

    #[test]
    fn test_reply_layout_has_six_nulls() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 160>::new();
        let mut out = OutgoingSlot::new();

        storage.write(node.id, 0xFB, 1, b"Shed\0").unwrap();
        storage
            .write(node.id, 0xFB, USER_DESCRIPTION_OFFSET, b"West yard\0")
            .unwrap();

        let incoming = incoming(&mut pool, Mti::SimpleNodeInfoRequest, &[]);
        service.handle_simple_node_info_request(
            &mut node,
            &mut pool,
            &mut storage,
            incoming,
            &mut out,
        );

        let reply = pool.get(out.take().unwrap());
        assert_eq!(reply.mti, Mti::SimpleNodeInfoReply);
        assert_eq!(reply.byte_at(0), 4);
        assert_eq!(reply.count_nulls(), 6);

        // Manufacturer block, then the user block opened by version 2.
        let payload = reply.payload.as_slice();
        assert_eq!(&payload[1..19], b"Basic OpenLcb Node");
        assert_eq!(payload[19], 0);
        let user_version_at = 1
            + "Basic OpenLcb Node".len() + 1
            + "Test".len() + 1
            + "0.0.1".len() + 1
            + "0.0.1".len() + 1;
        assert_eq!(payload[user_version_at], 2);
        let name_start = user_version_at + 1;
        assert_eq!(&payload[name_start..name_start + 4], b"Shed");
    }

    #[test]
    fn test_reply_without_user_strings_still_terminates() {
        let service = Service::new();
        let mut pool = Pool::new();
        let mut node = test_node();
        let mut storage = RamStorage::<256, 160>::new();
        let mut out = OutgoingSlot::new();

        let incoming = incoming(&mut pool, Mti::SimpleNodeInfoRequest, &[]);
        service.handle_simple_node_info_request(
            &mut node,
            &mut pool,
            &mut storage,
            incoming,
            &mut out,
        );

        let reply = pool.get(out.take().unwrap());
        assert_eq!(reply.count_nulls(), 6);
        // Two empty user strings: the payload ends with version 2 and
        // two nulls.
        let payload = reply.payload.as_slice();
        assert_eq!(&payload[payload.len() - 3..], &[2, 0, 0]);
    }
}
