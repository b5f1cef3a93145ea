pub mod archive;
pub mod catalog;
pub mod config;
pub mod confluence;
pub mod convert;
pub mod error;
pub mod hierarchy;
pub mod idmap;
pub mod markup;
pub mod metadata;
pub mod paths;
pub mod publish;
pub mod resolve;
pub mod runtime;
