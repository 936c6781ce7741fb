//! View & Replica Model
//!
//! Plain data describing replica chains. No I/O happens here.

mod configuration;
mod replica;
mod view;

pub use configuration::{Configuration, ConfiguredTable};
pub use replica::{Replica, ReplicaStatus};
pub use view::{View, EMPTY_VIEW_ID};
