pub mod drainer;
