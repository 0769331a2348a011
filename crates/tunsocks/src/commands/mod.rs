pub mod check;
pub mod config;
pub mod decode;
pub mod run;
