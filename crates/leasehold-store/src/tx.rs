use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::Result;

/// Run `f` inside an `IMMEDIATE` transaction on `conn`.
///
/// The write lock is taken up front, so two connections (or processes)
/// serialise here instead of failing mid-way on lock upgrade. `Ok` commits;
/// `Err` drops the transaction, which rolls it back.
pub fn run_in_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}
