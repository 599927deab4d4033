//! The linear migration chain.
//!
//! Steps link to their predecessor; a valid chain has exactly one root,
//! exactly one tip, no forks and no cycles, and walking predecessors from
//! the tip reaches the root in exactly `len` steps.

use super::error::MigrationError;
use super::ledger::LedgerEntry;
use super::step::MigrationStep;
use std::collections::{HashMap, HashSet};

/// An ordered, validated list of migration steps.
#[derive(Debug, Clone)]
pub struct MigrationChain {
    steps: Vec<MigrationStep>,
}

impl MigrationChain {
    /// Validate and order a set of steps.
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self, MigrationError> {
        if steps.is_empty() {
            return Err(invalid("chain has no steps"));
        }

        let mut by_id: HashMap<&str, &MigrationStep> = HashMap::new();
        for step in &steps {
            if by_id.insert(step.id.as_str(), step).is_some() {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
        }

        let roots: Vec<&str> = steps
            .iter()
            .filter(|s| s.predecessor.is_none())
            .map(|s| s.id.as_str())
            .collect();
        if roots.len() != 1 {
            return Err(invalid(format!(
                "expected exactly one root step, found {}: {:?}",
                roots.len(),
                roots
            )));
        }

        // predecessor id -> successor
        let mut successor: HashMap<&str, &MigrationStep> = HashMap::new();
        for step in &steps {
            let Some(pred) = step.predecessor.as_deref() else {
                continue;
            };
            if !by_id.contains_key(pred) {
                return Err(invalid(format!(
                    "step {} follows unknown step {}",
                    step.id, pred
                )));
            }
            if let Some(other) = successor.insert(pred, step) {
                return Err(invalid(format!(
                    "fork after {}: both {} and {} follow it",
                    pred, other.id, step.id
                )));
            }
        }

        let mut ordered = Vec::with_capacity(steps.len());
        let mut seen = HashSet::new();
        let mut current = by_id[roots[0]];
        loop {
            if !seen.insert(current.id.as_str()) {
                return Err(invalid(format!("cycle through {}", current.id)));
            }
            ordered.push(current.clone());
            match successor.get(current.id.as_str()) {
                Some(next) => current = *next,
                None => break,
            }
        }

        if ordered.len() != steps.len() {
            let unreachable: Vec<&str> = steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !seen.contains(id))
                .collect();
            return Err(invalid(format!(
                "steps not reachable from the root: {:?}",
                unreachable
            )));
        }

        Ok(Self { steps: ordered })
    }

    /// Steps in application order.
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false: a chain has at least one step.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step with no predecessor.
    pub fn root(&self) -> &MigrationStep {
        &self.steps[0]
    }

    /// The step with no successor.
    pub fn tip(&self) -> &MigrationStep {
        &self.steps[self.steps.len() - 1]
    }

    /// Look up a step by id.
    pub fn get(&self, id: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in application order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Number of predecessor links followed from the tip back to the root,
    /// counting both ends.
    pub fn walk_length(&self) -> usize {
        let mut length = 0;
        let mut current = Some(self.tip());
        while let Some(step) = current {
            length += 1;
            current = step.predecessor.as_deref().and_then(|p| self.get(p));
            if length > self.steps.len() {
                break;
            }
        }
        length
    }

    /// Verify the ledger against the chain and return the applied prefix length.
    ///
    /// The ledger must hold exactly the first `n` steps, with matching
    /// checksums; anything else is drift.
    pub fn verify_ledger(&self, applied: &[LedgerEntry]) -> Result<usize, MigrationError> {
        let applied_ids: HashMap<&str, &LedgerEntry> =
            applied.iter().map(|e| (e.id.as_str(), e)).collect();

        for entry in applied {
            let step = self.get(&entry.id).ok_or_else(|| MigrationError::ChainOrder {
                message: format!("ledger records unknown step {}", entry.id),
            })?;
            let expected = step.checksum();
            if entry.checksum != expected {
                return Err(MigrationError::ChecksumMismatch {
                    step: entry.id.clone(),
                    recorded: entry.checksum.clone(),
                    expected,
                });
            }
        }

        let prefix = self
            .steps
            .iter()
            .take_while(|s| applied_ids.contains_key(s.id.as_str()))
            .count();
        if prefix != applied.len() {
            let gap = &self.steps[prefix].id;
            return Err(MigrationError::ChainOrder {
                message: format!(
                    "ledger has {} applied steps but step {} in the middle of the chain is not applied",
                    applied.len(),
                    gap
                ),
            });
        }
        Ok(prefix)
    }

    /// Steps not yet applied, in order.
    pub fn pending(&self, applied: &[LedgerEntry]) -> Result<&[MigrationStep], MigrationError> {
        let prefix = self.verify_ledger(applied)?;
        Ok(&self.steps[prefix..])
    }

    /// Check that `id` is the next step to apply.
    ///
    /// Returns `Ok(false)` if it is already applied, `Ok(true)` if it may run
    /// now, and a chain-order error if its predecessor is not applied.
    pub fn check_applicable(&self, id: &str, applied: &[LedgerEntry]) -> Result<bool, MigrationError> {
        let step = self
            .get(id)
            .ok_or_else(|| MigrationError::UnknownStep(id.to_string()))?;
        let prefix = self.verify_ledger(applied)?;
        let position = self.position(id).unwrap_or(usize::MAX);

        if position < prefix {
            return Ok(false);
        }
        if position == prefix {
            return Ok(true);
        }
        Err(MigrationError::ChainOrder {
            message: format!(
                "cannot apply {}: predecessor {} has not been applied",
                id,
                step.predecessor.as_deref().unwrap_or("<root>")
            ),
        })
    }
}

fn invalid(message: impl Into<String>) -> MigrationError {
    MigrationError::InvalidChain {
        message: message.into(),
    }
}
