pub mod context;
pub mod engine;
pub mod events;
pub mod instance;
pub mod storage;
