use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod coordinator;
pub mod index;
pub mod materialize;
pub mod normalize;
pub mod schema;
pub mod store;
pub mod tasks;
