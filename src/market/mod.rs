pub mod binance;
pub mod buffer;
pub mod connection;
pub mod leader;
pub mod normalize;
pub mod persistence;
pub mod pipeline;
pub mod relay;
pub mod stats;
pub mod types;
