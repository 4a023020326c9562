// JDWP agent library for embedding a debug server in a host VM
//
// Implements the target-side half of the protocol that a debugger speaks:
// - Wire identifier management
// - Event requests, filtering and composite delivery
// - Suspension and run-lock coordination
// - Command dispatch
//
// The host VM plugs in through the `HostVm` and `HostObject` traits and the
// transport layer feeds command payloads into `CommandDispatcher`.

pub mod constants;
pub mod protocol;
pub mod wire;
pub mod vm;
pub mod ids;
pub mod events;
pub mod filter;
pub mod request;
pub mod suspension;
pub mod dispatch;
pub mod session;
pub mod mock;

pub use dispatch::{CommandDispatcher, CommandHandler};
pub use events::{Event, EventKind};
pub use ids::{IdKind, IdentifierManager};
pub use protocol::{AgentError, AgentResult, Reply};
pub use request::{EventRequest, EventRequestManager, SuspendPolicy};
pub use session::{EventSink, Session};
pub use suspension::SuspensionCoordinator;
pub use vm::{HandleRef, HostObject, HostVm};
