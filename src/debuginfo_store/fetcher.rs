use super::{BinaryDescriptor, FileLocator, Lookup};
use crate::trace::SymbolFileDescriptor;
use std::path::PathBuf;

/// ChainLocator asks `first`, then `second`. The first Found wins; an error is
/// reported only when neither locator found the file.
#[derive(Debug, Default)]
pub struct ChainLocator<A, B> {
    first: A,
    second: B,
}

impl<A, B> ChainLocator<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: FileLocator, B: FileLocator> FileLocator for ChainLocator<A, B> {
    async fn locate_binary(&self, binary: &BinaryDescriptor) -> Lookup<PathBuf> {
        let first = self.first.locate_binary(binary).await;
        if first.is_found() {
            return first;
        }
        combine(first, self.second.locate_binary(binary).await)
    }

    async fn locate_symbols(&self, symbols: &SymbolFileDescriptor) -> Lookup<PathBuf> {
        let first = self.first.locate_symbols(symbols).await;
        if first.is_found() {
            return first;
        }
        combine(first, self.second.locate_symbols(symbols).await)
    }
}

fn combine(first: Lookup<PathBuf>, second: Lookup<PathBuf>) -> Lookup<PathBuf> {
    match (first, second) {
        (_, Lookup::Found(path)) => Lookup::Found(path),
        (Lookup::Error(e), _) | (_, Lookup::Error(e)) => Lookup::Error(e),
        _ => Lookup::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(fn() -> Lookup<PathBuf>);

    impl FileLocator for Fixed {
        async fn locate_binary(&self, _: &BinaryDescriptor) -> Lookup<PathBuf> {
            (self.0)()
        }

        async fn locate_symbols(&self, _: &SymbolFileDescriptor) -> Lookup<PathBuf> {
            (self.0)()
        }
    }

    fn found() -> Lookup<PathBuf> {
        Lookup::Found(PathBuf::from("/found"))
    }

    fn not_found() -> Lookup<PathBuf> {
        Lookup::NotFound
    }

    fn error() -> Lookup<PathBuf> {
        Lookup::Error(anyhow::anyhow!("connection refused"))
    }

    fn descriptor() -> SymbolFileDescriptor {
        SymbolFileDescriptor {
            file_name: "app.pdb".to_string(),
            build_id: None,
            age: 1,
        }
    }

    #[tokio::test]
    async fn test_second_locator_is_asked_after_a_miss() {
        let chain = ChainLocator::new(Fixed(not_found), Fixed(found));
        assert!(chain.locate_symbols(&descriptor()).await.is_found());
    }

    #[tokio::test]
    async fn test_error_is_kept_only_without_a_hit() {
        let chain = ChainLocator::new(Fixed(error), Fixed(found));
        assert!(chain.locate_symbols(&descriptor()).await.is_found());

        let chain = ChainLocator::new(Fixed(error), Fixed(not_found));
        assert!(matches!(chain.locate_symbols(&descriptor()).await, Lookup::Error(_)));

        let chain = ChainLocator::new(Fixed(not_found), Fixed(not_found));
        assert!(matches!(chain.locate_symbols(&descriptor()).await, Lookup::NotFound));
    }
}
