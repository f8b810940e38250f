/// Supplies scoped transactions for token store and handler work.
pub trait TransactionManager: Send + Sync {
    fn start_transaction(&self) -> Box<dyn Transaction>;
}

/// A transaction opened by a [`TransactionManager`].
pub trait Transaction: Send {
    fn commit(&mut self);
    fn rollback(&mut self);
}

/// Transaction manager for handlers that manage their own consistency.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransaction;

impl TransactionManager for NoTransaction {
    fn start_transaction(&self) -> Box<dyn Transaction> {
        Box::new(NoopTransaction)
    }
}

struct NoopTransaction;

impl Transaction for NoopTransaction {
    fn commit(&mut self) {}

    fn rollback(&mut self) {}
}

/// Runs `work` inside a fresh transaction, committing on `Ok` and rolling
/// back on `Err`.
pub fn in_transaction<T, E>(
    manager: &dyn TransactionManager,
    work: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let mut transaction = manager.start_transaction();
    match work() {
        Ok(value) => {
            transaction.commit();
            Ok(value)
        }
        Err(err) => {
            transaction.rollback();
            Err(err)
        }
    }
}

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Active,
    Committed,
    RolledBack,
}

/// Unit of work scoping the processing of one event batch.
///
/// The batch processor commits inside the unit of work; a unit left active
/// after a successful return is committed by the work package, and rolled
/// back when the processor signals failure.
pub struct UnitOfWork {
    transaction: Box<dyn Transaction>,
    state: UnitOfWorkState,
}

impl UnitOfWork {
    pub fn begin(transaction: Box<dyn Transaction>) -> Self {
        Self {
            transaction,
            state: UnitOfWorkState::Active,
        }
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == UnitOfWorkState::Active
    }

    pub fn is_committed(&self) -> bool {
        self.state == UnitOfWorkState::Committed
    }

    /// Commits the underlying transaction; no-op unless the unit is active.
    pub fn commit(&mut self) {
        if self.is_active() {
            self.transaction.commit();
            self.state = UnitOfWorkState::Committed;
        }
    }

    /// Rolls the underlying transaction back; no-op unless the unit is active.
    pub fn rollback(&mut self) {
        if self.is_active() {
            self.transaction.rollback();
            self.state = UnitOfWorkState::RolledBack;
        }
    }
}
