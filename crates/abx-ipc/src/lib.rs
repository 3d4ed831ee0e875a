//! Local control channel for the abx ad blocker.
//!
//! Three independent pieces, all speaking to other processes on the same
//! machine: the read-only [`ControlFlags`] record published by the host,
//! the fire-and-forget [`ReportSender`] for block/whitelist events, and the
//! [`CommandServer`]/[`CommandClient`] pair for enable/disable and domain
//! exception commands.

mod command;
mod control;
mod report;

pub use command::{
    default_socket_path, CommandClient, CommandHandler, CommandRequest, CommandServer,
    CMD_ADD_EXCEPTION, CMD_DISABLE, CMD_ENABLE, CMD_REMOVE_EXCEPTION,
};
pub use control::ControlFlags;
pub use report::{ReportMessage, ReportSender};
