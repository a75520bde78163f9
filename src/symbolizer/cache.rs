use super::StackKey;
use crate::profile::ResolvedStack;
use moka::sync::Cache;
use std::sync::Arc;

/// StackMemo maps a stack to its resolved form. The first published value for a key wins.
#[derive(Debug, Clone)]
pub struct StackMemo {
    pub(crate) c: Cache<StackKey, Arc<ResolvedStack>>,
}

impl Default for StackMemo {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl StackMemo {
    pub fn new(cap: u64) -> Self {
        let c = Cache::new(cap);
        Self { c }
    }

    /// A memo that never evicts, so every stack resolves exactly once per load.
    pub fn unbounded() -> Self {
        let c = Cache::builder().build();
        Self { c }
    }

    pub fn get(&self, key: &StackKey) -> Option<Arc<ResolvedStack>> {
        self.c.get(key)
    }

    /// Publishes `stack` unless another caller got there first, and returns
    /// whichever value is now stored.
    pub fn get_or_publish(&self, key: StackKey, stack: Arc<ResolvedStack>) -> Arc<ResolvedStack> {
        self.c.entry(key).or_insert(stack).into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ProfileContext;

    fn stack() -> Arc<ResolvedStack> {
        Arc::new(ResolvedStack {
            context: ProfileContext::default(),
            frames: vec![],
        })
    }

    #[test]
    fn test_first_writer_wins() {
        let memo = StackMemo::default();
        let key = StackKey::Captured(7);
        let first = stack();
        let second = stack();

        let published = memo.get_or_publish(key, Arc::clone(&first));
        assert!(Arc::ptr_eq(&published, &first));
        let published = memo.get_or_publish(key, second);
        assert!(Arc::ptr_eq(&published, &first));
        assert!(Arc::ptr_eq(&memo.get(&key).unwrap(), &first));
    }

    #[test]
    fn test_synthetic_keys_are_distinct() {
        let memo = StackMemo::unbounded();
        let a = StackKey::Synthetic {
            context_id: 1,
            ip: 0x10,
        };
        let b = StackKey::Synthetic {
            context_id: 2,
            ip: 0x10,
        };
        memo.get_or_publish(a, stack());
        assert!(memo.get(&a).is_some());
        assert!(memo.get(&b).is_none());
    }
}
