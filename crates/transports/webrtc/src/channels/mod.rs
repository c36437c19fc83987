//! Data channels carrying poses to monitors

mod data_channel;

pub use data_channel::DataChannelSink;
