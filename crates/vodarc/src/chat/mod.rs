pub mod archive;
pub mod catalog;
pub mod fetcher;
pub mod replay;
