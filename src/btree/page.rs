//! # Node Page Image
//!
//! This module defines the fixed-size on-disk image of a node and its
//! serialize/deserialize pair. Every page begins with a 24-byte header
//! parsed via zerocopy, followed by the packed key suffixes and the
//! node's non-key payload.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  -----------------------------------------
//! 0       1     kind          0x01 inner, 0x02 leaf
//! 1       1     flags         bit 0: root, bit 1: unique mode
//! 2       2     num_keys      entry count (LE)
//! 4       1     suffix_bits   64 - shared prefix bits
//! 5       3     reserved      zero
//! 8       8     prefix        shared prefix value (LE)
//! 16      4     checksum      CRC-32 over bytes [24..page_size)
//! 20      4     reserved      zero
//! 24      ...   key suffixes  ceil(suffix_bits * num_keys / 8) bytes
//!         ...   leaf:  values, value_size bytes each
//!               inner: child ids, 4 bytes each (num_keys + 1),
//!                      then values (non-unique trees only)
//!         ...   zero padding to page_size
//! ```
//!
//! The layout is canonical: padding is always zero and the writer always
//! stores the recomputed prefix, so `serialize(deserialize(bytes)) ==
//! bytes` for any valid page and `deserialize(serialize(node)) == node`
//! up to cached hints.
//!
//! ## Structural Checks
//!
//! Decoding verifies the checksum, the kind and flag bits, the mode
//! against the tree configuration, array bounds against the page size,
//! the stored prefix against the decoded keys, and entry ordering. Any
//! mismatch is [`IndexError::Corruption`]: the page either never came
//! from this tree or was damaged in storage.

use crc::{Crc, CRC_32_ISCSI};
use eyre::Result;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{CHILD_ID_SIZE, NODE_HEADER_SIZE};
use crate::error::IndexError;

use super::node::{BTreeNode, NodeKind};
use super::{PageId, TreeConfig};

pub const NODE_KIND_INNER: u8 = 0x01;
pub const NODE_KIND_LEAF: u8 = 0x02;

pub const FLAG_ROOT: u8 = 0x01;
pub const FLAG_UNIQUE: u8 = 0x02;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    kind: u8,
    flags: u8,
    num_keys: U16<LittleEndian>,
    suffix_bits: u8,
    reserved: [u8; 3],
    prefix: U64<LittleEndian>,
    checksum: U32<LittleEndian>,
    reserved2: [u8; 4],
}

impl NodeHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < size_of::<Self>() {
            return Err(IndexError::Corruption(format!(
                "buffer too small for node header: {} < {}",
                data.len(),
                size_of::<Self>()
            ))
            .into());
        }
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| IndexError::Corruption(format!("failed to read node header: {:?}", e)).into())
    }

    pub fn num_keys(&self) -> usize {
        self.num_keys.get() as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NODE_KIND_LEAF
    }

    pub fn is_root(&self) -> bool {
        self.flags & FLAG_ROOT != 0
    }
}

const _: () = assert!(size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Serializes a node into its fixed-size page image.
///
/// Inner nodes must only reference persisted (positive) children; the
/// commit walk guarantees this by writing children first.
pub fn serialize_node(node: &BTreeNode) -> Result<Vec<u8>> {
    let cfg = node.config();
    let num_keys = node.num_keys();

    if num_keys > u16::MAX as usize {
        return Err(IndexError::InvariantViolation("entry count exceeds header field").into());
    }
    if node.overflows() {
        return Err(IndexError::InvariantViolation("serializing an overfull node").into());
    }

    let mut buf = vec![0u8; cfg.page_size];

    let bits = node.prefix_bits();
    let suffix_len = super::prefix::packed_payload_size(num_keys, bits);
    let mut offset = NODE_HEADER_SIZE;

    super::prefix::pack_suffixes(node.keys(), bits, &mut buf[offset..offset + suffix_len]);
    offset += suffix_len;

    if node.is_leaf() {
        offset = write_values(&mut buf, offset, node.values(), cfg.value_size)?;
    } else {
        for &child in node.child_ids() {
            if child <= 0 {
                return Err(IndexError::InvariantViolation(
                    "serializing an inner node with unpersisted children",
                )
                .into());
            }
            buf[offset..offset + CHILD_ID_SIZE].copy_from_slice(&(child as u32).to_le_bytes());
            offset += CHILD_ID_SIZE;
        }
        if !cfg.unique {
            offset = write_values(&mut buf, offset, node.values(), cfg.value_size)?;
        }
    }

    debug_assert!(offset <= cfg.page_size);

    let checksum = CRC32.checksum(&buf[NODE_HEADER_SIZE..]);
    let header = NodeHeader {
        kind: if node.is_leaf() {
            NODE_KIND_LEAF
        } else {
            NODE_KIND_INNER
        },
        flags: (if node.is_root() { FLAG_ROOT } else { 0 })
            | (if cfg.unique { FLAG_UNIQUE } else { 0 }),
        num_keys: U16::new(num_keys as u16),
        suffix_bits: 64 - bits.min(64),
        reserved: [0; 3],
        prefix: U64::new(node.prefix()),
        checksum: U32::new(checksum),
        reserved2: [0; 4],
    };
    buf[..NODE_HEADER_SIZE].copy_from_slice(header.as_bytes());

    Ok(buf)
}

/// Decodes a page image back into a node, verifying structure and
/// checksum.
pub fn deserialize_node(data: &[u8], cfg: TreeConfig, page_id: PageId) -> Result<BTreeNode> {
    if data.len() != cfg.page_size {
        return Err(IndexError::Corruption(format!(
            "page size mismatch: {} != {}",
            data.len(),
            cfg.page_size
        ))
        .into());
    }

    let header = NodeHeader::from_bytes(data)?;

    let kind = match header.kind {
        NODE_KIND_LEAF => NodeKind::Leaf,
        NODE_KIND_INNER => NodeKind::Inner,
        other => {
            return Err(IndexError::Corruption(format!("unknown node kind {:#04x}", other)).into())
        }
    };

    let unique = header.flags & FLAG_UNIQUE != 0;
    if unique != cfg.unique {
        return Err(IndexError::Corruption(format!(
            "mode mismatch: page is {}, tree is {}",
            if unique { "unique" } else { "non-unique" },
            if cfg.unique { "unique" } else { "non-unique" },
        ))
        .into());
    }

    if header.suffix_bits > 64 {
        return Err(
            IndexError::Corruption(format!("suffix width {} > 64", header.suffix_bits)).into(),
        );
    }

    let checksum = CRC32.checksum(&data[NODE_HEADER_SIZE..]);
    if checksum != header.checksum.get() {
        return Err(IndexError::Corruption(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            header.checksum.get(),
            checksum
        ))
        .into());
    }

    let num_keys = header.num_keys();
    let bits = 64 - header.suffix_bits;
    let suffix_len = super::prefix::packed_payload_size(num_keys, bits);

    let payload_len = suffix_len
        + match kind {
            NodeKind::Leaf => num_keys * cfg.value_size,
            NodeKind::Inner => {
                CHILD_ID_SIZE * (num_keys + 1)
                    + if cfg.unique { 0 } else { num_keys * cfg.value_size }
            }
        };
    if NODE_HEADER_SIZE + payload_len > cfg.page_size {
        return Err(IndexError::Corruption(format!(
            "{} entries do not fit a {}-byte page",
            num_keys, cfg.page_size
        ))
        .into());
    }

    let mut offset = NODE_HEADER_SIZE;
    let keys = super::prefix::unpack_suffixes(
        header.prefix.get(),
        bits,
        num_keys,
        &data[offset..offset + suffix_len],
    );
    offset += suffix_len;

    let (values, child_ids) = match kind {
        NodeKind::Leaf => {
            let values = read_values(data, offset, num_keys, cfg.value_size);
            (values, Vec::new())
        }
        NodeKind::Inner => {
            let mut child_ids = Vec::with_capacity(num_keys + 1);
            for _ in 0..=num_keys {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[offset..offset + CHILD_ID_SIZE]);
                let child = u32::from_le_bytes(raw);
                if child == 0 {
                    return Err(
                        IndexError::Corruption("inner node references page 0".to_string()).into(),
                    );
                }
                child_ids.push(child as PageId);
                offset += CHILD_ID_SIZE;
            }
            let values = if cfg.unique {
                Vec::new()
            } else {
                read_values(data, offset, num_keys, cfg.value_size)
            };
            (values, child_ids)
        }
    };

    check_ordering(&keys, &values, cfg.unique, kind)?;

    let node = BTreeNode::from_parts(cfg, page_id, kind, header.is_root(), keys, values, child_ids);

    if num_keys > 0 && node.prefix_bits() != bits {
        return Err(IndexError::Corruption(format!(
            "stored prefix width {} does not match keys (expected {})",
            bits,
            node.prefix_bits()
        ))
        .into());
    }

    Ok(node)
}

fn write_values(buf: &mut [u8], mut offset: usize, values: &[i64], width: usize) -> Result<usize> {
    for &value in values {
        let raw = (value as u64).to_le_bytes();
        if width < 8 && (value as u64) >> (width * 8) != 0 {
            return Err(IndexError::InvariantViolation(
                "value does not fit the configured element width",
            )
            .into());
        }
        buf[offset..offset + width].copy_from_slice(&raw[..width]);
        offset += width;
    }
    Ok(offset)
}

fn read_values(data: &[u8], mut offset: usize, count: usize, width: usize) -> Vec<i64> {
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(&data[offset..offset + width]);
        values.push(u64::from_le_bytes(raw) as i64);
        offset += width;
    }
    values
}

fn check_ordering(keys: &[i64], values: &[i64], unique: bool, kind: NodeKind) -> Result<()> {
    let pairs = !unique && (kind == NodeKind::Leaf || !values.is_empty());
    for i in 1..keys.len() {
        let ordered = if pairs {
            (keys[i - 1], values[i - 1]) < (keys[i], values[i])
        } else {
            keys[i - 1] < keys[i]
        };
        if !ordered {
            return Err(IndexError::Corruption(format!(
                "entries out of order at position {}",
                i
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(page_size: usize, unique: bool) -> TreeConfig {
        TreeConfig::new(page_size, unique, 8).unwrap()
    }

    fn sample_leaf(unique: bool) -> BTreeNode {
        let mut node = BTreeNode::new_leaf(cfg(256, unique), true);
        for (k, v) in [(3, 30), (1, 10), (9, 90), (4, 40)] {
            node.leaf_put(k, v, false).unwrap();
        }
        node
    }

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(size_of::<NodeHeader>(), NODE_HEADER_SIZE);
    }

    #[test]
    fn leaf_round_trip() {
        let node = sample_leaf(true);
        let bytes = serialize_node(&node).unwrap();
        assert_eq!(bytes.len(), 256);

        let decoded = deserialize_node(&bytes, cfg(256, true), 7).unwrap();
        assert_eq!(decoded.page_id(), 7);
        assert!(decoded.is_leaf());
        assert!(decoded.is_root());
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.keys(), node.keys());
        assert_eq!(decoded.values(), node.values());
        assert_eq!(decoded.current_size(), node.current_size());
    }

    #[test]
    fn inner_round_trip_non_unique() {
        let mut node = BTreeNode::new_inner(cfg(256, false), true);
        node.init_root(10, 2, 3, 4, 0, 0).unwrap();
        node.inner_put_separator(1, 20, 5, 6, 0).unwrap();

        let bytes = serialize_node(&node).unwrap();
        let decoded = deserialize_node(&bytes, cfg(256, false), 1).unwrap();

        assert!(!decoded.is_leaf());
        assert_eq!(decoded.keys(), &[10, 20]);
        assert_eq!(decoded.values(), &[2, 5]);
        assert_eq!(decoded.child_ids(), &[3, 4, 6]);
    }

    #[test]
    fn byte_image_is_canonical() {
        let node = sample_leaf(false);
        let bytes = serialize_node(&node).unwrap();
        let decoded = deserialize_node(&bytes, cfg(256, false), 2).unwrap();
        let reencoded = serialize_node(&decoded).unwrap();
        assert_eq!(bytes, reencoded);
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let node = sample_leaf(true);
        let mut bytes = serialize_node(&node).unwrap();
        bytes[NODE_HEADER_SIZE + 1] ^= 0xFF;

        let err = deserialize_node(&bytes, cfg(256, true), 1).unwrap_err();
        let kind = err.downcast_ref::<IndexError>().unwrap();
        assert!(matches!(kind, IndexError::Corruption(_)));
        assert!(kind.to_string().contains("checksum"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let node = sample_leaf(true);
        let mut bytes = serialize_node(&node).unwrap();
        bytes[0] = 0x7E;

        let err = deserialize_node(&bytes, cfg(256, true), 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn mode_mismatch_is_rejected() {
        let node = sample_leaf(true);
        let bytes = serialize_node(&node).unwrap();

        let err = deserialize_node(&bytes, cfg(256, false), 1).unwrap_err();
        assert!(err.to_string().contains("mode mismatch"));
    }

    #[test]
    fn unpersisted_children_refuse_to_serialize() {
        let mut node = BTreeNode::new_inner(cfg(256, true), true);
        node.init_root(10, 0, -1, -2, 0, 0).unwrap();

        let err = serialize_node(&node).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::InvariantViolation(_))
        ));
    }

    #[test]
    fn empty_root_leaf_round_trips() {
        let node = BTreeNode::new_leaf(cfg(128, true), true);
        let bytes = serialize_node(&node).unwrap();
        let decoded = deserialize_node(&bytes, cfg(128, true), 5).unwrap();
        assert_eq!(decoded.num_keys(), 0);
        assert!(decoded.is_root());
        assert!(decoded.is_leaf());
    }

    #[test]
    fn narrow_value_width_round_trips() {
        let cfg4 = TreeConfig::new(128, true, 4).unwrap();
        let mut node = BTreeNode::new_leaf(cfg4, true);
        node.leaf_put(1, 0xAABB, false).unwrap();
        node.leaf_put(2, 7, false).unwrap();

        let bytes = serialize_node(&node).unwrap();
        let decoded = deserialize_node(&bytes, cfg4, 1).unwrap();
        assert_eq!(decoded.values(), &[0xAABB, 7]);
    }

    #[test]
    fn oversized_value_for_narrow_width_fails() {
        let cfg1 = TreeConfig::new(128, true, 1).unwrap();
        let mut node = BTreeNode::new_leaf(cfg1, true);
        node.leaf_put(1, 300, false).unwrap();

        assert!(serialize_node(&node).is_err());
    }
}
