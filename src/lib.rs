pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod controller;
pub mod machine;
pub mod paging;
pub mod report;
pub mod util;
