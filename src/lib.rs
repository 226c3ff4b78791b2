pub mod config;
pub mod fetch;
pub mod model;
pub mod output;
pub mod parser;
pub mod snapshot;
pub mod source;
pub mod updater;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
