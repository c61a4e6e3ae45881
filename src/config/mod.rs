//! Configuration constants for the index core.
//!
//! All layout-related constants live in [`constants`]; import them from
//! there rather than redefining values locally.

mod constants;

pub use constants::{
    CHILD_ID_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_VALUE_SIZE, MAX_ENTRY_FOOTPRINT, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, NODE_HEADER_SIZE, PREFIX_METADATA_SIZE, STORAGE_HEADER_SIZE,
    UNDERFULL_DENOMINATOR, UNDERFULL_NUMERATOR,
};
