/*!
# Vigil DevKit - test doubles for the recovery kernel

- A fake compute control plane with scripted answers and a call log
- An event sink that records every task transition
- Fixtures for segments, hosts and monitor notifications
- A harness that runs real dispatches against all of the above
*/

pub mod compute_stub;
pub mod event_recorder;
pub mod fixtures;
pub mod test_utils;

pub use compute_stub::{ComputeCall, FakeComputeClient};
pub use event_recorder::RecordingEventSink;
pub use test_utils::TestHarness;
