//! This module provides ways to tweak mocked servers, so that they can return errors on some tests

use crate::error::CalDavError;

/// This stores some behaviour tweaks, that describe how a mocked server will behave during a given test
///
/// So that a functions fails _n_ times after _m_ initial successes, set `(m, n)` for the suited parameter
#[derive(Default, Clone, Debug)]
pub struct MockBehaviour {
    /// If this is true, every action will be allowed
    pub is_suspended: bool,
    /// Failures are reported as `AuthFailed` rather than `ConnectionFailed`
    pub fails_with_auth: bool,
    /// Every call blocks until its deadline expires or is cancelled
    pub hangs: bool,

    pub discover_behaviour: (u32, u32),
    pub sync_behaviour: (u32, u32),
    pub list_events_behaviour: (u32, u32),
    pub fetch_event_behaviour: (u32, u32),
    pub put_event_behaviour: (u32, u32),
    pub delete_event_behaviour: (u32, u32),
    pub create_calendar_behaviour: (u32, u32),
}

impl MockBehaviour {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls will fail at once, for `n_fails` times
    pub fn fail_now(n_fails: u32) -> Self {
        Self {
            discover_behaviour: (0, n_fails),
            sync_behaviour: (0, n_fails),
            list_events_behaviour: (0, n_fails),
            fetch_event_behaviour: (0, n_fails),
            put_event_behaviour: (0, n_fails),
            delete_event_behaviour: (0, n_fails),
            create_calendar_behaviour: (0, n_fails),
            ..Self::default()
        }
    }

    /// Every call is rejected with `AuthFailed`
    pub fn reject_credentials() -> Self {
        Self {
            fails_with_auth: true,
            ..Self::fail_now(u32::MAX)
        }
    }

    /// Suspend this mock behaviour until you call `resume`
    pub fn suspend(&mut self) {
        self.is_suspended = true;
    }
    /// Make this behaviour active again
    pub fn resume(&mut self) {
        self.is_suspended = false;
    }

    pub fn can_discover(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.discover_behaviour, "discover")
    }
    pub fn can_sync(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.sync_behaviour, "sync")
    }
    pub fn can_list_events(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.list_events_behaviour, "list_events")
    }
    pub fn can_fetch_event(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.fetch_event_behaviour, "fetch_event")
    }
    pub fn can_put_event(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.put_event_behaviour, "put_event")
    }
    pub fn can_delete_event(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.delete_event_behaviour, "delete_event")
    }
    pub fn can_create_calendar(&mut self) -> Result<(), CalDavError> {
        self.check(|b| &mut b.create_calendar_behaviour, "create_calendar")
    }

    fn check<F>(&mut self, counter: F, descr: &str) -> Result<(), CalDavError>
    where
        F: FnOnce(&mut Self) -> &mut (u32, u32),
    {
        if self.is_suspended { return Ok(()) }
        let fails_with_auth = self.fails_with_auth;
        decrement(counter(self), descr).map_err(|msg| {
            if fails_with_auth {
                CalDavError::AuthFailed
            } else {
                CalDavError::ConnectionFailed(msg)
            }
        })
    }
}


/// Return Ok(()) in case the value is `(1+, _)` or `(_, 0)`, or return Err and decrement otherwise
fn decrement(value: &mut (u32, u32), descr: &str) -> Result<(), String> {
    let remaining_successes = value.0;
    let remaining_failures = value.1;

    if remaining_successes > 0 {
        value.0 -= 1;
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    } else if remaining_failures > 0 {
        value.1 -= 1;
        log::debug!("Mock behaviour: failing a {} ({:?})", descr, value);
        Err(format!("Mocked behaviour requires this {} to fail this time. ({:?})", descr, value))
    } else {
        log::debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        Ok(())
    }
}
