pub mod connection;
mod dispatch;
mod handshake;
mod message;
mod send;
