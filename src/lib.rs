//! Bridge an interactive SSH shell to browser clients over WebSocket.

pub mod tty;
