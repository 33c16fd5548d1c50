use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use vivaha_sync::auth::StaticToken;
use vivaha_sync::model::{
    BudgetCategory, Expense, Guest, Registry, Resource, ResourceKind, RsvpStatus, SeatingTable,
    Todo, Vendor,
};
use vivaha_sync::offline::OfflineSwitch;
use vivaha_sync::remote::HttpRemote;
use vivaha_sync::share::{self, AccessLevel};
use vivaha_sync::split::{ExpenseDraft, Ledger, SplitMode};
use vivaha_sync::store::LocalStore;
use vivaha_sync::sync::{Collection, LoadSource, SyncContext};
use vivaha_sync::{backup, config, db};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Local-first sync client for the wedding planner dashboard"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Local store namespace (defaults to app.user)
    #[arg(long)]
    user: Option<String>,
    /// Work on someone else's dashboard through a share token or link
    #[arg(long)]
    share: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store the bearer token used for backend calls
    Login {
        #[arg(long)]
        token: String,
    },
    /// Remove every cached collection and the token of this user
    Logout,
    Offline {
        #[command(subcommand)]
        action: OfflineAction,
    },
    /// Print a collection (cache first, then the server when online)
    List { kind: ResourceKind },
    /// Create a record from a JSON object
    Add {
        kind: ResourceKind,
        #[arg(long)]
        json: String,
    },
    /// Merge a JSON patch into a record
    Update {
        kind: ResourceKind,
        id: String,
        #[arg(long)]
        json: String,
    },
    Delete { kind: ResourceKind, id: String },
    /// Push the whole collection to the server
    Save { kind: ResourceKind },
    ToggleTodo { id: String },
    /// Set a guest's RSVP (pending, accepted, declined)
    Rsvp { id: String, status: String },
    Split {
        #[command(subcommand)]
        action: SplitAction,
    },
    Share {
        #[command(subcommand)]
        action: ShareAction,
    },
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Debug, Subcommand)]
enum OfflineAction {
    On,
    Off,
    Toggle,
    Status,
}

#[derive(Debug, Subcommand)]
enum SplitAction {
    People,
    AddPerson {
        name: String,
        #[arg(long)]
        email: Option<String>,
    },
    RemovePerson { id: String },
    Expenses,
    AddExpense {
        #[arg(long)]
        category: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        total: f64,
        #[arg(long)]
        paid_by: String,
        /// Custom share as `<person id>=<amount>`; omit for an equal split
        #[arg(long = "split")]
        splits: Vec<String>,
    },
    DeleteExpense { id: String },
    Settle { id: String },
    Balances,
    /// Turn budget categories into split expenses
    ImportBudget,
}

#[derive(Debug, Subcommand)]
enum ShareAction {
    /// Show what a share token grants
    Open { link: String },
    Generate {
        #[arg(long, default_value = "view")]
        level: AccessLevel,
    },
    Links,
    Revoke { token: String },
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    Export {
        #[arg(default_value = "vivaha-backup.json")]
        path: PathBuf,
    },
    Import { path: PathBuf },
}

struct Session {
    store: LocalStore,
    remote: Arc<HttpRemote>,
    ctx: SyncContext,
}

impl Session {
    fn collection<T: Resource>(&self) -> Collection<T> {
        Collection::new(self.store.clone(), self.remote.clone(), self.ctx.clone())
    }

    fn ledger(&self) -> Ledger {
        Ledger::new(self.store.clone(), self.remote.clone(), self.ctx.clone())
    }
}

macro_rules! for_kind {
    ($kind:expr, $func:ident($($arg:expr),*)) => {
        match $kind {
            ResourceKind::Guests => $func::<Guest>($($arg),*).await,
            ResourceKind::Budget => $func::<BudgetCategory>($($arg),*).await,
            ResourceKind::Todos => $func::<Todo>($($arg),*).await,
            ResourceKind::Seating => $func::<SeatingTable>($($arg),*).await,
            ResourceKind::Vendors => $func::<Vendor>($($arg),*).await,
            ResourceKind::Registries => $func::<Registry>($($arg),*).await,
            ResourceKind::Expenses => $func::<Expense>($($arg),*).await,
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let user = args.user.clone().unwrap_or_else(|| cfg.app.user.clone());
    let owner_store = LocalStore::new(pool, user);
    let offline = OfflineSwitch::restore(&owner_store).await;
    let base_url = cfg.api_base_url();
    let owner_remote = Arc::new(HttpRemote::new(
        &base_url,
        Arc::new(owner_store.clone()),
        cfg.app.read_timeout(),
    )?);

    let session = match &args.share {
        None => Session {
            store: owner_store.clone(),
            remote: owner_remote.clone(),
            ctx: SyncContext::owner(offline.clone()),
        },
        Some(link) => {
            let shared =
                share::open_shared(owner_remote.as_ref(), &owner_store, &offline, link).await?;
            info!(couple = shared.couple_name(), level = %shared.access.access_level, "using shared dashboard");
            let remote = HttpRemote::new(
                &base_url,
                Arc::new(StaticToken(shared.token.clone())),
                cfg.app.read_timeout(),
            )?;
            Session {
                store: owner_store.scoped(shared.namespace()),
                remote: Arc::new(remote),
                ctx: SyncContext::new(offline.clone(), shared.sync_access()),
            }
        }
    };

    match args.command {
        Command::Login { token } => {
            owner_store.set_session_token(token.trim()).await?;
            println!("token saved for {}", owner_store.namespace());
        }
        Command::Logout => {
            owner_store.clear_user_data().await;
            println!("signed out {}", owner_store.namespace());
        }
        Command::Offline { action } => {
            match action {
                OfflineAction::On => offline.set_offline(),
                OfflineAction::Off => offline.set_online(),
                OfflineAction::Toggle => {
                    offline.toggle();
                }
                OfflineAction::Status => {}
            }
            offline.persist(&owner_store).await?;
            println!("{}", offline.state());
        }
        Command::List { kind } => for_kind!(kind, list(&session))?,
        Command::Add { kind, json } => for_kind!(kind, add(&session, &json))?,
        Command::Update { kind, id, json } => for_kind!(kind, update(&session, &id, &json))?,
        Command::Delete { kind, id } => for_kind!(kind, delete(&session, &id))?,
        Command::Save { kind } => for_kind!(kind, save(&session))?,
        Command::ToggleTodo { id } => {
            let mut todos = session.collection::<Todo>();
            todos.load().await;
            print_json(&todos.toggle(&id).await?)?;
        }
        Command::Rsvp { id, status } => {
            let status: RsvpStatus = serde_json::from_value(Value::String(status.to_lowercase()))
                .with_context(|| format!("unknown RSVP status {status}"))?;
            let mut guests = session.collection::<Guest>();
            guests.load().await;
            print_json(&guests.set_rsvp(&id, status).await?)?;
        }
        Command::Split { action } => run_split(&session, action).await?,
        Command::Share { action } => run_share(&owner_remote, &owner_store, &offline, action).await?,
        Command::Backup { action } => match action {
            BackupAction::Export { path } => {
                let snapshot = backup::collect(&session.store).await;
                backup::write_file(&path, &snapshot).await?;
                println!("{} entries written to {}", snapshot.entries.len(), path.display());
            }
            BackupAction::Import { path } => {
                let snapshot = backup::read_file(&path).await?;
                let restored = backup::restore(&session.store, &snapshot).await?;
                println!("{restored} entries restored");
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_object(json: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(json).context("--json is not valid JSON")?;
    if !value.is_object() {
        bail!("--json must be a JSON object");
    }
    Ok(value)
}

async fn list<T: Resource>(session: &Session) -> Result<()> {
    let mut items = session.collection::<T>();
    match items.load().await {
        LoadSource::Remote => info!(kind = %T::KIND, "loaded from server"),
        LoadSource::Cache => info!(kind = %T::KIND, "showing cached data"),
        LoadSource::Empty => warn!(kind = %T::KIND, "nothing cached and server unavailable"),
    }
    print_json(items.items())
}

async fn add<T: Resource>(session: &Session, json: &str) -> Result<()> {
    let record: T = serde_json::from_value(parse_object(json)?)
        .with_context(|| format!("not a valid {} record", T::KIND))?;
    let mut items = session.collection::<T>();
    items.load().await;
    print_json(&items.create(record).await?)
}

async fn update<T: Resource>(session: &Session, id: &str, json: &str) -> Result<()> {
    let patch = parse_object(json)?;
    let mut items = session.collection::<T>();
    items.load().await;
    print_json(&items.patch(id, &patch).await?)
}

async fn delete<T: Resource>(session: &Session, id: &str) -> Result<()> {
    let mut items = session.collection::<T>();
    items.load().await;
    items.delete(id).await?;
    println!("deleted {id}");
    Ok(())
}

async fn save<T: Resource>(session: &Session) -> Result<()> {
    let mut items = session.collection::<T>();
    items.load_cached().await;
    let report = items.save_all().await?;
    println!(
        "{} created, {} updated",
        report.created.len(),
        report.updated.len()
    );
    Ok(())
}

fn parse_custom_splits(raw: &[String]) -> Result<SplitMode> {
    if raw.is_empty() {
        return Ok(SplitMode::Equal);
    }
    let mut amounts = HashMap::new();
    for entry in raw {
        let (person, amount) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--split expects <person id>=<amount>, got {entry}"))?;
        let amount: f64 = amount
            .trim()
            .parse()
            .with_context(|| format!("invalid amount in --split {entry}"))?;
        amounts.insert(person.trim().to_string(), amount);
    }
    Ok(SplitMode::Custom(amounts))
}

async fn run_split(session: &Session, action: SplitAction) -> Result<()> {
    let mut ledger = session.ledger();
    ledger.load().await;
    match action {
        SplitAction::People => print_json(ledger.people())?,
        SplitAction::AddPerson { name, email } => {
            print_json(&ledger.add_person(&name, email.as_deref()).await?)?
        }
        SplitAction::RemovePerson { id } => {
            let removed = ledger.remove_person(&id).await?;
            println!("removed {}", removed.name);
        }
        SplitAction::Expenses => print_json(ledger.expenses())?,
        SplitAction::AddExpense {
            category,
            description,
            total,
            paid_by,
            splits,
        } => {
            let draft = ExpenseDraft {
                category_name: category,
                description,
                total_amount: total,
                paid_by,
                mode: parse_custom_splits(&splits)?,
            };
            print_json(&ledger.add_expense(draft).await?)?;
        }
        SplitAction::DeleteExpense { id } => {
            ledger.delete_expense(&id).await?;
            println!("deleted {id}");
        }
        SplitAction::Settle { id } => {
            let expense = ledger.toggle_settled(&id).await?;
            println!("{} settled: {}", expense.description, expense.settled);
        }
        SplitAction::Balances => {
            for transfer in ledger.balances() {
                let name = |id: &str| {
                    ledger
                        .person(id)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| "Unknown".to_string())
                };
                println!(
                    "{} owes {} {:.2}",
                    name(&transfer.from),
                    name(&transfer.to),
                    transfer.amount
                );
            }
            println!(
                "total {:.2}, settled {:.2}",
                ledger.total_spent(),
                ledger.settled_amount()
            );
        }
        SplitAction::ImportBudget => {
            let mut budget = session.collection::<BudgetCategory>();
            budget.load().await;
            if budget.items().is_empty() {
                bail!("no budget categories found; add items to the budget first");
            }
            let imported = ledger.import_budget(budget.items()).await?;
            println!("{imported} budget categories imported");
        }
    }
    Ok(())
}

async fn run_share(
    remote: &HttpRemote,
    store: &LocalStore,
    offline: &OfflineSwitch,
    action: ShareAction,
) -> Result<()> {
    match action {
        ShareAction::Open { link } => {
            let shared = share::open_shared(remote, store, offline, &link).await?;
            println!(
                "{}'s dashboard, {} access",
                shared.couple_name(),
                shared.access.access_level
            );
        }
        ShareAction::Generate { level } => {
            let link = remote.generate_share_link(level).await?;
            println!("{}", link.share_link.unwrap_or(link.token));
        }
        ShareAction::Links => print_json(&remote.list_share_links().await?)?,
        ShareAction::Revoke { token } => {
            remote.revoke_share_link(&token).await?;
            println!("revoked");
        }
    }
    Ok(())
}
