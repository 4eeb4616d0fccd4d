/// Validates that an inbound event originates from the one authorized
/// operator and the one authorized chat. Both identifiers are required at
/// startup; there is no runtime error path here, only a boolean.
#[derive(Debug, Clone, Copy)]
pub struct AccessGuard {
    operator_id: u64,
    chat_id: i64,
}

impl AccessGuard {
    pub fn new(operator_id: u64, chat_id: i64) -> Self {
        Self {
            operator_id,
            chat_id,
        }
    }

    pub fn authorize(&self, sender_id: u64, chat_id: i64) -> bool {
        sender_id == self.operator_id && chat_id == self.chat_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_the_configured_pair() {
        let guard = AccessGuard::new(42, -100);
        assert!(guard.authorize(42, -100));
        assert!(!guard.authorize(42, -101));
        assert!(!guard.authorize(43, -100));
        assert!(!guard.authorize(0, 0));
    }
}
