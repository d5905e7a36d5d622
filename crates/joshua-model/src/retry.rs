//! Model-level transaction runner: the shared retry loop instantiated
//! with the model error taxonomy.

use futures::future::BoxFuture;
use joshua_kv::{run_transaction, Database, Versionstamp};

use crate::error::ModelError;

pub(crate) async fn run_model_transaction<D, T, F>(
    db: &D,
    body: F,
) -> Result<(T, Versionstamp), ModelError>
where
    D: Database,
    F: for<'tx> FnMut(&'tx mut D::Tx) -> BoxFuture<'tx, Result<T, ModelError>>,
{
    run_transaction(db, body).await
}
