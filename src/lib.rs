//! Node Controller - Remote hardware control over a message bus
//!
//! A requester addresses a named control (a hardware knob, or the reserved
//! `topology` / `controls` queries) on a remote node; the node agent executes
//! a GET or PUT against local hardware state and replies with a leveled result.

pub mod backend;
pub mod bus;
pub mod config;
pub mod control;
pub mod protocol;
pub mod topology;
