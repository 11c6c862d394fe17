pub mod buddy;
pub mod page_supply;
pub mod slab;
