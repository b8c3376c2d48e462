//! The port-handler contract shared by TCP and SCTP, and the UDP handler
//! signature.

use std::sync::Arc;

use crate::addr::Addr;
use crate::session::Session;

/// Callback bundle an application protocol registers on a port.
///
/// Lifecycle per session: `new_session` exactly once, then zero or more
/// `new_data`, then `session_closed_1` ("please terminate, flush what you
/// have") and finally `session_closed_2` exactly once ("resources released,
/// free your private data"). No callback follows `session_closed_2`.
/// `init`/`deinit` bracket the registration itself.
///
/// Callbacks run beneath the per-session lock, so packets of one flow are
/// seen in order; a handler that needs to wait must hand off to its own task.
/// Returning false from `new_session` or `new_data` schedules the session for
/// closure.
pub struct PortHandler {
    pub init: Option<Box<dyn Fn() + Send + Sync>>,
    pub new_session: Box<dyn Fn(&Arc<Session>) -> bool + Send + Sync>,
    pub new_data: Box<dyn Fn(&Arc<Session>, &[u8]) -> bool + Send + Sync>,
    pub session_closed_1: Option<Box<dyn Fn(&Arc<Session>) + Send + Sync>>,
    pub session_closed_2: Option<Box<dyn Fn(&Arc<Session>) + Send + Sync>>,
    pub deinit: Option<Box<dyn Fn() + Send + Sync>>,
}

impl PortHandler {
    /// Handler with the two mandatory callbacks; the optional ones default to
    /// absent and can be filled in afterwards.
    pub fn new<S, D>(new_session: S, new_data: D) -> Self
    where
        S: Fn(&Arc<Session>) -> bool + Send + Sync + 'static,
        D: Fn(&Arc<Session>, &[u8]) -> bool + Send + Sync + 'static,
    {
        Self {
            init: None,
            new_session: Box::new(new_session),
            new_data: Box::new(new_data),
            session_closed_1: None,
            session_closed_2: None,
            deinit: None,
        }
    }
}

/// Datagram handler registered on a UDP port.
///
/// Receives `(source address, source port, destination address, destination
/// port, payload)`. Must not block; hand off to a task for slow work.
pub type UdpHandler = Box<dyn Fn(&Addr, u16, &Addr, u16, &[u8]) + Send + Sync>;
