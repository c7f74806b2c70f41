use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, TransactionManager};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::warn;

use crate::error::{Error, Result};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConn = PooledConnection<'static, AsyncPgConnection>;

pub const TRANSACTION_MISSING: &str = "transaction missing from scope";

// Carries the open transaction through a request so repositories can be
// called uniformly without threading a connection parameter. Repositories
// asking an empty scope for a connection get a distinct contract error
// instead of silently opening their own transaction.
pub struct TxScope {
    conn: Mutex<Option<DbConn>>,
}

impl TxScope {
    pub async fn begin(pool: &DbPool) -> Result<Self> {
        let mut conn = pool
            .get_owned()
            .await
            .map_err(|err| Error::Upstream(format!("connection pool: {err}")))?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    // A scope with no active transaction.
    pub fn detached() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    pub async fn conn(&self) -> Result<MappedMutexGuard<'_, DbConn>> {
        let guard = self.conn.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut())
            .map_err(|_| Error::contract(TRANSACTION_MISSING))
    }

    pub async fn commit(self) -> Result<()> {
        let mut conn = self.take()?;
        AnsiTransactionManager::commit_transaction(&mut *conn).await?;
        Ok(())
    }

    pub async fn rollback(self) {
        match self.take() {
            Ok(mut conn) => {
                if let Err(err) = AnsiTransactionManager::rollback_transaction(&mut *conn).await {
                    warn!("transaction rollback failed: {err}");
                }
            }
            Err(_) => warn!("rollback requested on a scope without a transaction"),
        }
    }

    fn take(self) -> Result<DbConn> {
        self.conn
            .into_inner()
            .ok_or_else(|| Error::contract(TRANSACTION_MISSING))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_scope_reports_missing_transaction() {
        let scope = TxScope::detached();
        match scope.conn().await {
            Err(Error::Contract(msg)) => assert_eq!(msg, TRANSACTION_MISSING),
            other => panic!("expected a missing-transaction error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn committing_a_detached_scope_fails() {
        let scope = TxScope::detached();
        assert!(matches!(scope.commit().await, Err(Error::Contract(_))));
    }
}
