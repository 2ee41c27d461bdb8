//! Ready-made compilers over a fresh in-memory schema.

use std::sync::Arc;

use quarry_core::QuarryResult;
use quarry_db::query::Compiler;
use quarry_db::registry::ModelRegistry;
use quarry_db::testing;

use crate::test_database::TestDatabase;

/// A compiler over a new in-memory database holding `registry`'s tables.
///
/// The returned [`TestDatabase`] shares the compiler's connection and
/// statement counter.
pub async fn compiler_for(registry: ModelRegistry) -> QuarryResult<(TestDatabase, Arc<Compiler>)> {
    let db = TestDatabase::try_new()?;
    db.setup_registry(&registry).await?;
    db.reset_query_count();
    let compiler = Compiler::new(db.shared(), Arc::new(registry));
    Ok((db, compiler))
}

/// A compiler over the fixture models of [`quarry_db::testing`].
pub async fn sqlite_compiler() -> QuarryResult<(TestDatabase, Arc<Compiler>)> {
    compiler_for(testing::builder().build()?).await
}
