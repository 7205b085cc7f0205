//! Core engine - agent connections, command handles, server selection, scheduling

mod command;
mod connection;
pub mod protocol;
mod scheduler;
mod selector;
mod server;

pub use command::{Command, CommandState, ReturnCode, RunOptions};
pub use connection::{AgentConnection, CommandEvent, COMMAND_BUFFER, CONNECT_TIMEOUT};
pub use scheduler::{sleep, Invocation, Scheduler};
pub use selector::{Predicate, Selector, Slice};
pub use server::{Server, ServerList};
