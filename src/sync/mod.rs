//! State synchronization: the change stream protocol and remote-store
//! conflict resolution.

pub mod patch;
pub mod resolver;
pub mod stream;

pub use patch::{PatchOp, StateSnapshot};
pub use resolver::{resolve, ConflictStrategy, RemoteForwarder, RemoteMutation, RemoteSync, Resolution};
pub use stream::{ChangeStream, StreamClient, StreamMessage, StreamPayload};
