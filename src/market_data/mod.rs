pub mod actor;
pub mod autoscaler;
pub mod book;
pub mod collaborators;
pub mod counters;
pub mod dispatcher;
pub mod integrity;
pub mod multiplexer;
pub mod snapshot;
pub mod state_machine;
pub mod supervisor;
pub mod trade_tape;
pub mod types;

pub use actor::{ActorLimits, SymbolActor, SymbolEvent, SymbolHandle};
pub use book::{ApplyOutcome, BookReplica, SnapshotOutcome};
pub use dispatcher::{Dispatcher, IntegrityLevelWire, MetricSnapshot, SymbolStatus};
pub use integrity::{IntegrityLevel, IntegrityMonitor};
pub use multiplexer::{DepthStreamMode, Multiplexer, StreamSpeed};
pub use snapshot::{GlobalBackoff, SnapshotFetcher, SymbolBackoff};
pub use state_machine::{StateMachine, SymbolState, Trigger};
pub use supervisor::ResyncSupervisor;
pub use trade_tape::TradeTape;
pub use types::{DepthDiff, Level, PriceKey, Side, Snapshot, Trade};
