use super::{ActionKind, ActionSortKey, AfterTransactionCompletionProcess, Executable};
use crate::core::Result;
use crate::session::SessionContext;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Bookkeeping for a bulk statement (`UPDATE ... WHERE`, `DELETE ... WHERE`)
/// run outside the action lists
///
/// Never queued: adding it to the action queue registers its completion
/// callback and invalidates the affected spaces right away.
#[derive(Debug)]
pub struct BulkOperationCleanupAction {
    spaces: BTreeSet<String>,
    after_process: Option<Box<BulkCleanupProcess>>,
}

impl BulkOperationCleanupAction {
    pub fn new<I, S>(spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spaces: BTreeSet<String> = spaces.into_iter().map(Into::into).collect();
        Self {
            after_process: Some(Box::new(BulkCleanupProcess {
                spaces: spaces.iter().cloned().collect(),
            })),
            spaces,
        }
    }
}

/// Marks the bulk-updated spaces as changed once the transaction ends
#[derive(Debug)]
struct BulkCleanupProcess {
    spaces: Vec<String>,
}

#[async_trait]
impl AfterTransactionCompletionProcess for BulkCleanupProcess {
    async fn do_after_transaction_completion(
        self: Box<Self>,
        _success: bool,
        session: &SessionContext,
    ) -> Result<()> {
        session.timestamps().invalidate(&self.spaces)
    }
}

#[async_trait]
impl Executable for BulkOperationCleanupAction {
    fn kind(&self) -> ActionKind {
        ActionKind::BulkCleanup
    }

    fn property_spaces(&self) -> Vec<String> {
        self.spaces.iter().cloned().collect()
    }

    async fn execute(&mut self, _session: &SessionContext) -> Result<()> {
        Ok(())
    }

    fn take_after_transaction_completion_process(
        &mut self,
    ) -> Option<Box<dyn AfterTransactionCompletionProcess>> {
        self.after_process
            .take()
            .map(|p| p as Box<dyn AfterTransactionCompletionProcess>)
    }

    fn sort_key(&self) -> ActionSortKey {
        ActionSortKey::new("bulk-cleanup", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spaces_are_deduplicated() {
        let mut action = BulkOperationCleanupAction::new(["ledger", "accounts", "ledger"]);
        assert_eq!(action.property_spaces(), vec!["accounts", "ledger"]);
        assert!(action.take_after_transaction_completion_process().is_some());
        assert!(action.take_after_transaction_completion_process().is_none());
    }
}
