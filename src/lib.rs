pub mod aggregate;
pub mod backend;
pub mod config;
pub mod model;
pub mod mutation;
pub mod normalize;
pub mod notify;
pub mod realtime;
pub mod view;
