pub mod bulk;
pub mod clock;
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod model;
pub mod ops;
pub mod sync;
pub mod tabular;
pub mod upload;
