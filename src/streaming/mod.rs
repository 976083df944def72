// Streaming module - per-session synchronization, conditioning and fan-out
//
// - `synchronizer` / `drift`: pairing the front and reference channels
// - `rereference`: combining an aligned pair into one signal
// - `session`: the per-connection pipeline and its lifecycle
// - `broadcaster`: delivery to live observers
// - `registry`: live sessions keyed by device pair

pub mod broadcaster;
pub mod drift;
pub mod registry;
pub mod rereference;
pub mod session;
pub mod synchronizer;
pub mod types;

pub use broadcaster::{BroadcastReport, Broadcaster, OutboundFrame, DEFAULT_SUBSCRIBER_CAPACITY};
pub use registry::{RegistrationResult, SessionInfo, SessionRegistry};
pub use rereference::{ReReferencer, ReferenceScheme};
pub use session::{status_message, PipelineConfig, StreamPipeline};
pub use synchronizer::{AlignedPair, AlignmentPolicy, ChannelSynchronizer, SynchronizerConfig};
pub use types::{ConditionedBlock, SessionState, SessionStats, StreamError, StreamResult};
