// Persistence of conditioned samples
//
// - `traits`: the sink interface (`SignalStore` / `SignalConnection`) and errors
// - `gateway`: retrying connection state machine with bounded batches
// - `writer`: background task decoupling the pipeline from the sink
// - `postgres`: PostgreSQL implementation of the sink

pub mod gateway;
pub mod postgres;
pub mod traits;
pub mod writer;

pub use gateway::{GatewayConfig, LinkState, PersistenceGateway};
pub use postgres::PostgresSignalStore;
pub use traits::{
    PersistenceError, PersistenceResult, SignalConnection, SignalQuery, SignalRow, SignalStore,
    StoredSignal,
};
pub use writer::{PersistenceHandle, PersistenceStatus, PersistenceWriter};
