pub mod benchmark;
pub mod master;
pub mod standalone;
pub mod stats;
pub mod worker;
