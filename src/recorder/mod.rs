//! Recording sessions
//!
//! - `SessionStateMachine`, the pure lifecycle model
//! - `SessionCoordinator`, which drives engines, files and exports through it
//! - `LifecycleEvent`, what front-ends observe

pub mod coordinator;
pub mod events;
pub mod session;
pub mod state;

pub use coordinator::SessionCoordinator;
pub use events::{LifecycleEvent, LIFECYCLE_EVENT_CAPACITY};
pub use session::{SessionHandle, SessionSnapshot};
pub use state::{CaptureMode, IllegalTransition, SessionEvent, SessionState, SessionStateMachine};
