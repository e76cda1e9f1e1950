/// Number of free chapter transitions before a subscription is required.
pub const TRIAL_LIMIT: usize = 1;

/// Paywall gate consulted before every choice submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    trial_limit: usize,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::new(TRIAL_LIMIT)
    }
}

impl AccessPolicy {
    pub fn new(trial_limit: usize) -> Self {
        Self { trial_limit }
    }

    pub fn can_proceed(&self, chapter_count: usize, is_subscribed: bool) -> bool {
        is_subscribed || chapter_count < self.trial_limit
    }
}

/// A choice held back by the paywall, replayed once after the reader
/// subscribes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChoice(Option<String>);

impl PendingChoice {
    /// Replaces any previously stored choice.
    pub fn store(&mut self, choice: impl Into<String>) {
        self.0 = Some(choice.into());
    }

    pub fn peek(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Removes the stored choice; a second call yields `None`.
    pub fn take(&mut self) -> Option<String> {
        self.0.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trial_limit() {
        let policy = AccessPolicy::default();
        assert!(policy.can_proceed(0, false));
        assert!(!policy.can_proceed(1, false));
        assert!(!policy.can_proceed(1000, false));
        assert!(policy.can_proceed(1000, true));
        assert!(policy.can_proceed(0, true));
    }

    #[test]
    fn test_custom_trial_limit() {
        let policy = AccessPolicy::new(3);
        assert!(policy.can_proceed(2, false));
        assert!(!policy.can_proceed(3, false));
    }

    #[test]
    fn test_pending_choice_taken_once() {
        let mut pending = PendingChoice::default();
        pending.store("Open the door");
        pending.store("Run away");
        assert_eq!(pending.peek(), Some("Run away"));
        assert_eq!(pending.take().as_deref(), Some("Run away"));
        assert_eq!(pending.take(), None);
    }
}
