//! Single-flight processing guard

/// Per-session lock allowing one dispatch at a time
///
/// Each acquisition hands out a fresh ticket. Pipeline events carrying an
/// older ticket belong to a superseded dispatch and are discarded.
#[derive(Debug, Default)]
pub struct ProcessingGuard {
    held: Option<u64>,
    next_ticket: u64,
}

impl ProcessingGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: None,
            next_ticket: 1,
        }
    }

    /// Take the guard, returning its ticket, or `None` if already held
    pub fn try_acquire(&mut self) -> Option<u64> {
        if self.held.is_some() {
            return None;
        }
        let ticket = self.next_ticket.max(1);
        self.next_ticket = ticket + 1;
        self.held = Some(ticket);
        Some(ticket)
    }

    /// Release the guard if `ticket` still owns it
    ///
    /// Idempotent; a stale ticket is a no-op. Returns whether the guard was released.
    pub fn release(&mut self, ticket: u64) -> bool {
        if self.held == Some(ticket) {
            self.held = None;
            true
        } else {
            false
        }
    }

    /// Clear the guard unconditionally, returning the ticket that held it
    pub const fn clear(&mut self) -> Option<u64> {
        self.held.take()
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Whether `ticket` is the current holder
    #[must_use]
    pub fn is_current(&self, ticket: u64) -> bool {
        self.held == Some(ticket)
    }

    /// Ticket of the current holder
    #[must_use]
    pub const fn ticket(&self) -> Option<u64> {
        self.held
    }
}
