/*!
# Blink DevKit - Stubs and helpers for gateway development

Library for exercising the blink gateway without a broker:
- In-memory gateway session recording every publish
- Scripted metrics source (including induced CPU failures)
- Test harness with wait/assert helpers on published events
*/

pub mod metrics_stub;
pub mod session_stub;
pub mod test_utils;

pub use metrics_stub::ScriptedMetrics;
pub use session_stub::{MockGatewaySession, PublishTarget, PublishedEvent};
pub use test_utils::TestHarness;
