mod delayed_operation;

pub use delayed_operation::{DelayedOperation, DelayedOperationPurgatory};
