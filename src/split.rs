//! Shared-expense ledger: who paid what, who owes whom.
//!
//! Expenses have no backend endpoint, so the ledger lives entirely in the
//! local store. People are kept beside the expenses under their own key.

use crate::model::{BudgetCategory, Expense, RecordIds, Resource, Split};
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::sync::{Collection, LoadSource, SyncContext, SyncError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const PEOPLE_KEY: &str = "vivahaSplitPeople";

/// Custom splits may be off from the total by at most a cent.
pub const SPLIT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SplitMode {
    Equal,
    /// Amount per person id.
    Custom(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
pub struct ExpenseDraft {
    pub category_name: String,
    pub description: String,
    pub total_amount: f64,
    pub paid_by: String,
    pub mode: SplitMode,
}

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error("total amount must be a finite number greater than zero")]
    NonPositiveTotal,
    #[error("share for {0} must be a finite amount of zero or more")]
    InvalidShare(String),
    #[error("add people before splitting an expense")]
    NoPeople,
    #[error("unknown person: {0}")]
    UnknownPerson(String),
    #[error("custom splits must add up to {expected:.2}; current total {actual:.2}")]
    SplitMismatch { expected: f64, actual: f64 },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// One settle-up payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: f64,
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

pub struct Ledger {
    store: LocalStore,
    people: Vec<Person>,
    expenses: Collection<Expense>,
}

impl Ledger {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, ctx: SyncContext) -> Self {
        let expenses = Collection::new(store.clone(), remote, ctx);
        Self {
            store,
            people: Vec::new(),
            expenses,
        }
    }

    pub async fn load(&mut self) -> LoadSource {
        self.people = self.store.get_data(PEOPLE_KEY).await.unwrap_or_default();
        self.expenses.load().await
    }

    pub fn people(&self) -> &[Person] {
        &self.people
    }

    pub fn expenses(&self) -> &[Expense] {
        self.expenses.items()
    }

    pub fn person(&self, id: &str) -> Option<&Person> {
        self.people.iter().find(|p| p.id == id)
    }

    fn ensure_writable(&self) -> Result<(), SplitError> {
        if self.expenses.context().access.can_write() {
            Ok(())
        } else {
            Err(SyncError::ReadOnly.into())
        }
    }

    async fn save_people(&self) {
        self.store.set_data(PEOPLE_KEY, &self.people).await;
    }

    pub async fn add_person(&mut self, name: &str, email: Option<&str>) -> Result<Person, SplitError> {
        self.ensure_writable()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SplitError::Missing("name"));
        }
        let person = Person {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.map(str::trim).filter(|e| !e.is_empty()).map(String::from),
        };
        self.people.push(person.clone());
        self.save_people().await;
        debug!(id = %person.id, "person added");
        Ok(person)
    }

    /// Drop a person, their splits in every expense, and any expense payer
    /// references to them.
    pub async fn remove_person(&mut self, id: &str) -> Result<Person, SplitError> {
        self.ensure_writable()?;
        let idx = self
            .people
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| SplitError::UnknownPerson(id.to_string()))?;
        let removed = self.people.remove(idx);
        self.save_people().await;

        let touched: Vec<String> = self
            .expenses
            .items()
            .iter()
            .filter(|e| e.paid_by == id || e.splits.iter().any(|s| s.person_id == id))
            .filter_map(|e| e.ids().key().map(String::from))
            .collect();
        for key in touched {
            self.expenses
                .update(&key, |expense| {
                    expense.splits.retain(|s| s.person_id != id);
                    if expense.paid_by == id {
                        expense.paid_by.clear();
                    }
                })
                .await?;
        }
        info!(id, "person removed");
        Ok(removed)
    }

    fn build_splits(&self, draft: &ExpenseDraft) -> Result<Vec<Split>, SplitError> {
        if draft.category_name.trim().is_empty() {
            return Err(SplitError::Missing("category"));
        }
        if draft.description.trim().is_empty() {
            return Err(SplitError::Missing("description"));
        }
        if !draft.total_amount.is_finite() || draft.total_amount <= 0.0 {
            return Err(SplitError::NonPositiveTotal);
        }
        if draft.paid_by.trim().is_empty() {
            return Err(SplitError::Missing("paid by"));
        }
        if self.people.is_empty() {
            return Err(SplitError::NoPeople);
        }
        if self.person(&draft.paid_by).is_none() {
            return Err(SplitError::UnknownPerson(draft.paid_by.clone()));
        }

        let splits = match &draft.mode {
            SplitMode::Equal => {
                let share = round_cents(draft.total_amount / self.people.len() as f64);
                self.people
                    .iter()
                    .map(|p| Split {
                        person_id: p.id.clone(),
                        amount: share,
                        paid: p.id == draft.paid_by,
                    })
                    .collect()
            }
            SplitMode::Custom(amounts) => {
                if let Some(unknown) = amounts.keys().find(|id| self.person(id).is_none()) {
                    return Err(SplitError::UnknownPerson(unknown.clone()));
                }
                if let Some((person, _)) = amounts.iter().find(|(_, a)| !a.is_finite() || **a < 0.0) {
                    return Err(SplitError::InvalidShare(person.clone()));
                }
                let actual: f64 = amounts.values().sum();
                if (actual - draft.total_amount).abs() > SPLIT_TOLERANCE {
                    return Err(SplitError::SplitMismatch {
                        expected: draft.total_amount,
                        actual,
                    });
                }
                self.people
                    .iter()
                    .filter_map(|p| {
                        let amount = amounts.get(&p.id).copied().unwrap_or(0.0);
                        (amount > 0.0).then(|| Split {
                            person_id: p.id.clone(),
                            amount,
                            paid: p.id == draft.paid_by,
                        })
                    })
                    .collect()
            }
        };
        Ok(splits)
    }

    pub async fn add_expense(&mut self, draft: ExpenseDraft) -> Result<Expense, SplitError> {
        self.ensure_writable()?;
        let splits = self.build_splits(&draft)?;
        let expense = Expense {
            ids: RecordIds::default(),
            category_name: draft.category_name.trim().to_string(),
            description: draft.description.trim().to_string(),
            total_amount: draft.total_amount,
            paid_by: draft.paid_by,
            splits,
            date: Utc::now(),
            settled: false,
        };
        Ok(self.expenses.create(expense).await?)
    }

    pub async fn delete_expense(&mut self, key: &str) -> Result<Expense, SplitError> {
        Ok(self.expenses.delete(key).await?)
    }

    pub async fn toggle_settled(&mut self, key: &str) -> Result<Expense, SplitError> {
        Ok(self
            .expenses
            .update(key, |expense| expense.settled = !expense.settled)
            .await?)
    }

    pub fn total_spent(&self) -> f64 {
        self.expenses().iter().map(|e| e.total_amount).sum()
    }

    pub fn settled_amount(&self) -> f64 {
        self.expenses()
            .iter()
            .filter(|e| e.settled)
            .map(|e| e.total_amount)
            .sum()
    }

    /// Net position of every person over unsettled expenses. Positive means
    /// they are owed money. People come first in ledger order, then any
    /// ids only referenced by expenses.
    pub fn net_balances(&self) -> Vec<(String, f64)> {
        let mut net: Vec<(String, f64)> = self.people.iter().map(|p| (p.id.clone(), 0.0)).collect();
        let mut credit = |id: &str, amount: f64| match net.iter_mut().find(|(p, _)| p == id) {
            Some((_, total)) => *total += amount,
            None => net.push((id.to_string(), amount)),
        };
        for expense in self.expenses().iter().filter(|e| !e.settled) {
            credit(&expense.paid_by, expense.total_amount);
            for split in &expense.splits {
                credit(&split.person_id, -split.amount);
            }
        }
        net
    }

    /// Greedy settle-up: each debtor pays creditors in order until covered.
    pub fn balances(&self) -> Vec<Transfer> {
        let net = self.net_balances();
        let mut creditors: Vec<(String, f64)> = net
            .iter()
            .filter(|(_, amount)| *amount > SPLIT_TOLERANCE)
            .cloned()
            .collect();
        let debtors = net.iter().filter(|(_, amount)| *amount < -SPLIT_TOLERANCE);

        let mut transfers = Vec::new();
        for (debtor, debt) in debtors {
            let mut remaining = debt.abs();
            for (creditor, credit) in creditors.iter_mut() {
                if remaining < SPLIT_TOLERANCE {
                    break;
                }
                if *credit < SPLIT_TOLERANCE {
                    continue;
                }
                let amount = remaining.min(*credit);
                transfers.push(Transfer {
                    from: debtor.clone(),
                    to: creditor.clone(),
                    amount: round_cents(amount),
                });
                remaining -= amount;
                *credit -= amount;
            }
        }
        transfers
    }

    /// Add one `budget-<id>` expense per budget category that has an amount
    /// and is not imported yet, split equally and paid by the first person.
    pub async fn import_budget(&mut self, categories: &[BudgetCategory]) -> Result<usize, SplitError> {
        self.ensure_writable()?;
        let mut imported = 0;
        for category in categories {
            let Some(source_id) = category.ids.key() else {
                continue;
            };
            // A category imported before it synced is keyed on its client id.
            let already = [category.ids.server_id.as_deref(), category.ids.id.as_deref()]
                .into_iter()
                .flatten()
                .any(|id| self.expenses.find(&format!("budget-{id}")).is_some());
            if already {
                continue;
            }
            let budget_id = format!("budget-{source_id}");
            let amount = if category.actual_amount > 0.0 {
                category.actual_amount
            } else {
                category.estimated_amount
            };
            if amount <= 0.0 {
                continue;
            }

            let share = if self.people.is_empty() {
                0.0
            } else {
                round_cents(amount / self.people.len() as f64)
            };
            let expense = Expense {
                ids: RecordIds {
                    id: Some(budget_id),
                    ..Default::default()
                },
                category_name: category.name.clone(),
                description: format!("{} (from Budget)", category.name),
                total_amount: amount,
                paid_by: self.people.first().map(|p| p.id.clone()).unwrap_or_default(),
                splits: self
                    .people
                    .iter()
                    .map(|p| Split {
                        person_id: p.id.clone(),
                        amount: share,
                        paid: false,
                    })
                    .collect(),
                date: Utc::now(),
                settled: false,
            };
            self.expenses.create(expense).await?;
            imported += 1;
        }
        info!(imported, "budget categories imported");
        Ok(imported)
    }
}
