//! Streaming: snapshot-polling reconciliation loop and the registry that
//! tracks every active delivery stream for lifecycle recovery.

mod reconcile;
mod registry;

pub use reconcile::{
    run_reconcile_loop, start_stream, ConversationSource, StreamOptions, DIVERGENCE_SEPARATOR,
};
pub use registry::{
    NoopWakeLock, RecoveryCallback, StreamMetadata, StreamRegistry, WakeLock,
};
