// Request Mixing
//
// Result slots, the pending table, the mixing queue, dispatch jitter, and
// the mixer that ties them together.

pub mod mixer;
pub mod pending;
pub mod queue;
pub mod slot;
pub mod timing;

pub use mixer::{Mixer, Submission};
pub use pending::{PendingRequest, PendingTable};
pub use queue::{MixingQueue, QueueClosed};
pub use slot::{ResultSlot, SlotError, SlotOutcome, SlotState};
pub use timing::{compute_jitter, JitterConfig, JitterDistribution, JitterError, TimingJitter};
