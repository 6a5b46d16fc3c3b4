pub(self) mod client;
pub(self) mod replica;
pub(crate) mod replication;
pub(self) mod server;
pub(crate) mod session;

pub use client::Client;
pub use server::Server;
