pub mod assets;
pub mod config;
pub mod crawl;
pub mod destination;
pub mod error;
pub mod markup;
pub mod mirror;
pub mod model;
pub mod reconcile;
pub mod runtime;
pub mod snapshot;
pub mod source;
