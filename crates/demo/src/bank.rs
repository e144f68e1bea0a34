//! A small banking domain: accounts, transfers and a balances view.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::AggregateId;
use domain::{
    Aggregate, AggregateCommand, BoxError, Command, CommandContext, CommandRegistry, DomainEvent,
    ExecutableCommand,
};
use event_store::{EventEnvelope, Metadata};
use projections::ReadModel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Account {
    pub owner: Option<String>,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::Opened { .. } => "AccountOpened",
            AccountEvent::Deposited { .. } => "MoneyDeposited",
            AccountEvent::Withdrawn { .. } => "MoneyWithdrawn",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account {0} is already open")]
    AlreadyOpen(AggregateId),
    #[error("account {0} is not open")]
    NotOpen(AggregateId),
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
}

impl Aggregate for Account {
    type Event = AccountEvent;
    type Error = AccountError;

    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            AccountEvent::Opened { owner } => self.owner = Some(owner),
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
        }
    }

    fn snapshot_version() -> Option<u32> {
        Some(1)
    }
}

impl Account {
    fn ensure_open(&self, id: AggregateId) -> Result<(), AccountError> {
        match self.owner {
            Some(_) => Ok(()),
            None => Err(AccountError::NotOpen(id)),
        }
    }

    fn withdraw(&self, id: AggregateId, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open(id)?;
        if amount <= 0 {
            return Err(AccountError::InvalidAmount(amount));
        }
        if self.balance < amount {
            return Err(AccountError::InsufficientFunds {
                balance: self.balance,
                requested: amount,
            });
        }
        Ok(vec![AccountEvent::Withdrawn { amount }])
    }

    fn deposit(&self, id: AggregateId, amount: i64) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open(id)?;
        if amount <= 0 {
            return Err(AccountError::InvalidAmount(amount));
        }
        Ok(vec![AccountEvent::Deposited { amount }])
    }
}

pub struct OpenAccount {
    pub id: AggregateId,
    pub owner: String,
}

impl Command for OpenAccount {
    const COMMAND_TYPE: &'static str = "OpenAccount";

    fn aggregate_id(&self) -> Option<AggregateId> {
        Some(self.id)
    }
}

impl AggregateCommand for OpenAccount {
    type Aggregate = Account;

    fn target(&self) -> AggregateId {
        self.id
    }

    fn execute(&self, account: &Account) -> Result<Vec<AccountEvent>, AccountError> {
        if account.owner.is_some() {
            return Err(AccountError::AlreadyOpen(self.id));
        }
        Ok(vec![AccountEvent::Opened {
            owner: self.owner.clone(),
        }])
    }
}

pub struct Deposit {
    pub id: AggregateId,
    pub amount: i64,
    pub teller: String,
}

impl Command for Deposit {
    const COMMAND_TYPE: &'static str = "Deposit";

    fn aggregate_id(&self) -> Option<AggregateId> {
        Some(self.id)
    }

    fn metadata(&self) -> Metadata {
        Metadata::new().with("teller", self.teller.as_str())
    }
}

impl AggregateCommand for Deposit {
    type Aggregate = Account;

    fn target(&self) -> AggregateId {
        self.id
    }

    fn execute(&self, account: &Account) -> Result<Vec<AccountEvent>, AccountError> {
        account.deposit(self.id, self.amount)
    }
}

/// Moves money between two accounts in a single batch.
pub struct Transfer {
    pub from: AggregateId,
    pub to: AggregateId,
    pub amount: i64,
}

impl Command for Transfer {
    const COMMAND_TYPE: &'static str = "Transfer";

    fn aggregate_id(&self) -> Option<AggregateId> {
        Some(self.from)
    }
}

#[async_trait]
impl ExecutableCommand for Transfer {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), BoxError> {
        let (from, to, amount) = (self.from, self.to, self.amount);
        let transfer = Metadata::new().with("transfer_to", to.to_string());

        ctx.execute_with_metadata::<Account, _>(from, transfer, |account| {
            account.withdraw(from, amount)
        })
        .await?;
        ctx.execute::<Account, _>(to, |account| account.deposit(to, amount))
            .await
    }
}

pub fn registry() -> CommandRegistry {
    CommandRegistry::new()
        .aggregate::<OpenAccount>()
        .aggregate::<Deposit>()
        .executable::<Transfer>()
}

/// Balance per account owner.
#[derive(Debug, Default)]
pub struct Balances {
    owners: BTreeMap<AggregateId, String>,
    balances: BTreeMap<String, i64>,
}

impl Balances {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.balances.iter()
    }

    /// Publishes every balance as a gauge labelled by owner.
    pub fn record_metrics(&self) {
        for (owner, balance) in &self.balances {
            metrics::gauge!("demo_account_balance", "owner" => owner.clone())
                .set(*balance as f64);
        }
    }

    fn adjust(&mut self, id: AggregateId, delta: i64) {
        if let Some(owner) = self.owners.get(&id) {
            *self.balances.entry(owner.clone()).or_insert(0) += delta;
        }
    }
}

impl ReadModel for Balances {
    fn apply(&mut self, event: &EventEnvelope) -> projections::Result<()> {
        if event.aggregate_type != Account::aggregate_type() {
            return Ok(());
        }

        let account_event: AccountEvent = serde_json::from_value(event.payload.clone())?;
        match account_event {
            AccountEvent::Opened { owner } => {
                self.balances.entry(owner.clone()).or_insert(0);
                self.owners.insert(event.aggregate_id, owner);
            }
            AccountEvent::Deposited { amount } => self.adjust(event.aggregate_id, amount),
            AccountEvent::Withdrawn { amount } => self.adjust(event.aggregate_id, -amount),
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.balances.len()
    }
}
