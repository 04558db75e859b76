//! Keeps `LedgerAccount::current_balance` in step with the transactions that
//! reference the account.
//!
//! Writes go transaction first, account second. The `ledger_posted` flag on
//! the transaction is flipped before the account moves and flipped back if
//! the account write fails, so the flag always says whether the account holds
//! the transaction and the recovery sweep never posts or reverses twice. A
//! crash between the two writes leaves a balance discrepancy that the
//! double-entry audit reports.

use super::retry::update_with_retry;
use crate::domain::account::LedgerAccount;
use crate::domain::ports::Stores;
use crate::domain::transaction::Transaction;
use crate::error::{PaymentError, Result};
use tracing::{error, info, warn};

/// Posts a settled transaction's debit/credit to its account.
///
/// `prepare` runs inside the transaction's compare-and-set, before the flag is
/// raised; callers use it to write the status change that makes the
/// transaction postable. Returns the saved transaction.
pub(crate) async fn post_transaction<F>(
    stores: &Stores,
    max_retries: u32,
    transaction_id: &str,
    mut prepare: F,
) -> Result<Transaction>
where
    F: FnMut(&mut Transaction) -> Result<()> + Send,
{
    let (tx, should_post) = update_with_retry(
        stores.transactions.as_ref(),
        transaction_id,
        max_retries,
        PaymentError::TransactionNotFound,
        |tx| {
            prepare(tx)?;
            let should_post = tx.is_posted_status() && !tx.ledger_posted && tx.has_posting();
            if should_post {
                tx.ledger_posted = true;
            }
            Ok(should_post)
        },
    )
    .await?;

    if !should_post {
        return Ok(tx);
    }

    let posted = update_with_retry(
        stores.accounts.as_ref(),
        &tx.account_code,
        max_retries,
        PaymentError::AccountNotFound,
        |account: &mut LedgerAccount| {
            account.post(tx.debit_amount, tx.credit_amount);
            Ok(())
        },
    )
    .await;

    match posted {
        Ok((account, ())) => {
            info!(
                transaction_id = %tx.id,
                account_code = %account.account_code,
                debit = %tx.debit_amount,
                credit = %tx.credit_amount,
                balance = %account.current_balance,
                "transaction posted"
            );
            Ok(tx)
        }
        Err(e) => {
            warn!(transaction_id = %tx.id, error = %e, "account posting failed, releasing flag");
            restore_flag(stores, max_retries, &tx.id, false).await;
            Err(e)
        }
    }
}

/// Puts `ledger_posted` back after a failed account write. A failure here is
/// logged and left to the double-entry audit; the account error is the one
/// the caller sees.
async fn restore_flag(stores: &Stores, max_retries: u32, transaction_id: &str, posted: bool) {
    let restored = update_with_retry(
        stores.transactions.as_ref(),
        transaction_id,
        max_retries,
        PaymentError::TransactionNotFound,
        |tx| {
            tx.ledger_posted = posted;
            Ok(())
        },
    )
    .await;
    if let Err(e) = restored {
        error!(
            transaction_id,
            ledger_posted = posted,
            error = %e,
            "could not restore posting flag, ledger needs review"
        );
    }
}

/// Reverses a posted transaction's effect on its account.
///
/// `prepare` runs inside the transaction's compare-and-set, before the flag is
/// lowered.
pub(crate) async fn unpost_transaction<F>(
    stores: &Stores,
    max_retries: u32,
    transaction_id: &str,
    mut prepare: F,
) -> Result<Transaction>
where
    F: FnMut(&mut Transaction) -> Result<()> + Send,
{
    let (tx, was_posted) = update_with_retry(
        stores.transactions.as_ref(),
        transaction_id,
        max_retries,
        PaymentError::TransactionNotFound,
        |tx| {
            prepare(tx)?;
            let was_posted = tx.ledger_posted;
            tx.ledger_posted = false;
            Ok(was_posted)
        },
    )
    .await?;

    if was_posted && tx.has_posting() {
        let reversed = update_with_retry(
            stores.accounts.as_ref(),
            &tx.account_code,
            max_retries,
            PaymentError::AccountNotFound,
            |account: &mut LedgerAccount| {
                account.reverse(tx.debit_amount, tx.credit_amount);
                Ok(())
            },
        )
        .await;
        let (account, ()) = match reversed {
            Ok(saved) => saved,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "posting reversal failed, raising flag again");
                restore_flag(stores, max_retries, &tx.id, true).await;
                return Err(e);
            }
        };
        info!(
            transaction_id = %tx.id,
            account_code = %account.account_code,
            balance = %account.current_balance,
            "transaction posting reversed"
        );
    }
    Ok(tx)
}
