//! gRPC server and client for the model service

pub mod client;
pub mod server;

pub use client::WorkerClient;
pub use server::WorkerServer;
