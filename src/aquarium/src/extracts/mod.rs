pub mod network;
pub mod process;
