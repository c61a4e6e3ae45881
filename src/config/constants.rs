//! # Layout Constants
//!
//! This module centralizes the constants that define the node page layout
//! and the rebalancing thresholds. Constants that depend on each other are
//! co-located and cross-checked with compile-time assertions so a change
//! to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! NODE_HEADER_SIZE (24 bytes)
//!       │
//!       ├─> STORAGE_HEADER_SIZE (13 bytes: kind, flags, checksum, pad)
//!       │     Counted once per node in size accounting.
//!       │
//!       └─> PREFIX_METADATA_SIZE (11 bytes: prefix, suffix width, count)
//!             Counted as part of the encoded key array, so
//!             STORAGE_HEADER_SIZE + PREFIX_METADATA_SIZE must equal the
//!             physical header exactly.
//!
//! page_size (per tree, MIN_PAGE_SIZE..=MAX_PAGE_SIZE)
//!       │
//!       └─> underfull threshold = page_size * 3 / 4
//!             Deletion-time repair boundary; splits produce ~half-full
//!             nodes, so this is a trigger, not a floor.
//! ```

/// Size of the fixed node page header in bytes.
///
/// Layout: kind (1), flags (1), num_keys (2), suffix_bits (1), pad (3),
/// prefix (8), checksum (4), pad (4).
pub const NODE_HEADER_SIZE: usize = 24;

/// Header bytes attributed to the node itself in size accounting:
/// kind, flags, checksum and padding.
pub const STORAGE_HEADER_SIZE: usize = 13;

/// Header bytes attributed to the prefix-shared key array: the 8-byte
/// prefix, the 1-byte suffix bit width and the 2-byte entry count.
pub const PREFIX_METADATA_SIZE: usize = 11;

/// Size of a child page-id slot in an inner node.
pub const CHILD_ID_SIZE: usize = 4;

/// Default byte budget per node.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default width of a stored value element in bytes.
pub const DEFAULT_VALUE_SIZE: usize = 8;

/// Largest byte footprint one entry can add to a node: a full-width
/// key suffix, a value element and a child slot.
pub const MAX_ENTRY_FOOTPRINT: usize = 8 + DEFAULT_VALUE_SIZE + CHILD_ID_SIZE;

/// Smallest page size a tree accepts. Below this a node cannot hold the
/// header plus two full-width entries, and a single borrowed entry
/// could push a just-underfull node past its page budget.
pub const MIN_PAGE_SIZE: usize = 80;

/// Largest page size a tree accepts; entry counts must fit the header's
/// 16-bit count field with room to spare.
pub const MAX_PAGE_SIZE: usize = 1 << 20;

/// A non-root node is underfull when its serialized size drops below
/// `page_size * UNDERFULL_NUMERATOR / UNDERFULL_DENOMINATOR`.
pub const UNDERFULL_NUMERATOR: usize = 3;
pub const UNDERFULL_DENOMINATOR: usize = 4;

const _: () = assert!(
    NODE_HEADER_SIZE == STORAGE_HEADER_SIZE + PREFIX_METADATA_SIZE,
    "size accounting must cover the physical header exactly"
);

const _: () = assert!(
    MIN_PAGE_SIZE >= NODE_HEADER_SIZE + 2 * (8 + DEFAULT_VALUE_SIZE),
    "MIN_PAGE_SIZE must hold a header and two full-width entries"
);

const _: () = assert!(
    MIN_PAGE_SIZE * UNDERFULL_NUMERATOR / UNDERFULL_DENOMINATOR + MAX_ENTRY_FOOTPRINT
        <= MIN_PAGE_SIZE,
    "an underfull node plus one borrowed entry must fit the page"
);

const _: () = assert!(
    UNDERFULL_NUMERATOR < UNDERFULL_DENOMINATOR,
    "underfull threshold must be a proper fraction of the page size"
);
