pub mod data;

pub use data::*;

use log::info;

use crate::error::EngineResult;
use crate::store::traits::{Store, WriteBatch, WriteOp};

/// Write the built-in catalog in one batch. Safe to run on every start:
/// existing built-ins are overwritten while their counters are kept.
pub async fn seed_builtin_blocks<S: Store>(store: &S) -> EngineResult<usize> {
    let mut batch = WriteBatch::new();
    let definitions = builtin_blocks();
    let count = definitions.len();
    for definition in definitions {
        batch.push(WriteOp::PutBlockDefinition(definition));
    }

    store.apply(batch).await?;
    info!("Seeded {} built-in block definitions", count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::*;
    use crate::logic::SchemaValidator;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_defaults_satisfy_their_schemas() {
        for definition in builtin_blocks() {
            assert!(definition.builtin);
            assert_eq!(definition.author, SYSTEM_AUTHOR);
            assert!(
                SchemaValidator::check_defaults(&definition.config_schema).is_empty(),
                "{} has an invalid default",
                definition.id
            );
        }
    }

    #[test]
    fn test_only_loop_allows_self_loops() {
        let self_looping: Vec<_> = builtin_blocks()
            .into_iter()
            .filter(|d| d.allows_self_loop)
            .map(|d| d.id)
            .collect();
        assert_eq!(self_looping, vec!["builtin.logic.loop".to_string()]);
    }

    #[tokio::test]
    async fn test_seeding_twice_keeps_one_copy() {
        let store = MemoryStore::new();
        assert_eq!(seed_builtin_blocks(&store).await.unwrap(), 7);
        seed_builtin_blocks(&store).await.unwrap();

        let definitions = store.list_block_definitions().await.unwrap();
        let ids: HashSet<_> = definitions.iter().map(|d| d.id.clone()).collect();
        assert_eq!(definitions.len(), 7);
        assert_eq!(ids.len(), 7);
    }
}
