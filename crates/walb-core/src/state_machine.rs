//! Transition-table state machine for per-volume states.
//!
//! Each role declares its legal transitions as a static table of
//! `(from, to)` pairs; the table is the single source of truth. Long
//! operations hold a [`StateTransaction`]: the volume sits in a temporary
//! state while the operation runs, commits to the target resting state on
//! success, and falls back to the original state if the transaction is
//! dropped without commit.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A `(from, to)` transition pair.
pub type Pair = (&'static str, &'static str);

/// Thread-safe state machine over string states.
pub struct StateMachine {
    state: Mutex<String>,
    table: &'static [Pair],
}

impl StateMachine {
    /// Create a state machine in `initial` with the given transition table.
    #[must_use]
    pub fn new(initial: &str, table: &'static [Pair]) -> Self {
        Self { state: Mutex::new(initial.to_string()), table }
    }

    /// The current state.
    #[must_use]
    pub fn get(&self) -> String {
        self.state.lock().clone()
    }

    /// Set the state unconditionally. For daemon startup recovery only.
    pub fn set(&self, state: &str) {
        *self.state.lock() = state.to_string();
    }

    /// Whether the table allows `from -> to`.
    #[must_use]
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.table.iter().any(|&(f, t)| f == from && t == to)
    }

    /// Transition `from -> to` atomically.
    ///
    /// Fails with `BadState` if the current state is not `from` or the
    /// table does not allow the transition.
    pub fn transit(&self, from: &str, to: &str) -> Result<()> {
        if !self.allows(from, to) {
            return Err(Error::bad_state(format!("transition not allowed: {from} -> {to}")));
        }
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::bad_state(format!("expected state {from}, current {state}")));
        }
        *state = to.to_string();
        Ok(())
    }

    /// Begin a transaction: move `from -> temp` and return a guard.
    ///
    /// Dropping the guard without [`StateTransaction::commit`] moves the
    /// machine back to `from`.
    pub fn begin<'a>(&'a self, from: &str, temp: &str) -> Result<StateTransaction<'a>> {
        self.transit(from, temp)?;
        Ok(StateTransaction {
            sm: self,
            from: from.to_string(),
            temp: temp.to_string(),
            done: false,
        })
    }

    /// Verify the current state is one of `accepted`.
    pub fn verify_in(&self, accepted: &[&str]) -> Result<()> {
        let state = self.state.lock();
        if accepted.contains(&state.as_str()) {
            Ok(())
        } else {
            Err(Error::bad_state(state.clone()))
        }
    }
}

/// Guard for a temporary state. See [`StateMachine::begin`].
pub struct StateTransaction<'a> {
    sm: &'a StateMachine,
    from: String,
    temp: String,
    done: bool,
}

impl StateTransaction<'_> {
    /// Commit the transaction, moving `temp -> to`.
    pub fn commit(mut self, to: &str) -> Result<()> {
        self.sm.transit(&self.temp, to)?;
        self.done = true;
        Ok(())
    }

    /// The temporary state this transaction holds.
    #[must_use]
    pub fn temp_state(&self) -> &str {
        &self.temp
    }
}

impl Drop for StateTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            // Roll back without consulting the table; the volume must not
            // be stranded in a temporary state.
            *self.sm.state.lock() = self.from.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TABLE: &[Pair] = &[
        ("Clear", "InitVol"),
        ("InitVol", "SyncReady"),
        ("SyncReady", "FullSync"),
        ("FullSync", "Archived"),
    ];

    #[test]
    fn test_transit_follows_table() {
        let sm = StateMachine::new("Clear", TABLE);
        sm.transit("Clear", "InitVol").unwrap();
        sm.transit("InitVol", "SyncReady").unwrap();
        assert_eq!(sm.get(), "SyncReady");

        // Not in table.
        let err = sm.transit("SyncReady", "Archived").unwrap_err();
        assert!(matches!(err, Error::BadState(_)));

        // Wrong current state.
        let err = sm.transit("Clear", "InitVol").unwrap_err();
        assert!(matches!(err, Error::BadState(_)));
    }

    #[test]
    fn test_transaction_commit() {
        let sm = StateMachine::new("SyncReady", TABLE);
        let tran = sm.begin("SyncReady", "FullSync").unwrap();
        assert_eq!(sm.get(), "FullSync");
        tran.commit("Archived").unwrap();
        assert_eq!(sm.get(), "Archived");
    }

    #[test]
    fn test_transaction_abort_on_drop() {
        let sm = StateMachine::new("SyncReady", TABLE);
        {
            let _tran = sm.begin("SyncReady", "FullSync").unwrap();
            assert_eq!(sm.get(), "FullSync");
        }
        assert_eq!(sm.get(), "SyncReady");
    }

    #[test]
    fn test_verify_in() {
        let sm = StateMachine::new("SyncReady", TABLE);
        sm.verify_in(&["SyncReady", "Archived"]).unwrap();
        assert!(sm.verify_in(&["Archived"]).is_err());
    }
}
