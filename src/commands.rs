//! Subcommands of the `tally` binary.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};

use tally::resources::{Category, EntryKind, LedgerEntry, Profile, Task};
use tally::{Filter, Mutation, Record, RecordId, ResourceKind, ScopeKey, ScopeView, SyncEngine};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print a collection
  List {
    resource: ResourceKind,
    /// Only rows where FIELD equals VALUE (repeatable)
    #[arg(long = "where", value_name = "FIELD=VALUE", value_parser = parse_condition)]
    conditions: Vec<(String, String)>,
  },
  /// Create a task
  AddTask {
    title: String,
    /// Due date (YYYY-MM-DD)
    #[arg(long)]
    due: Option<String>,
  },
  /// Record an expense, or an income with --income
  AddEntry {
    amount: f64,
    #[arg(long)]
    income: bool,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    note: Option<String>,
  },
  /// Flip a task between open and done
  Toggle { id: String },
  /// Delete a row
  Delete { resource: ResourceKind, id: String },
  /// Print a collection every time it changes, until Ctrl-C
  Watch { resource: ResourceKind },
}

fn parse_condition(s: &str) -> std::result::Result<(String, String), String> {
  match s.split_once('=') {
    Some((field, value)) if !field.is_empty() => Ok((field.to_string(), value.to_string())),
    _ => Err(format!("expected FIELD=VALUE, got '{}'", s)),
  }
}

pub async fn run(engine: &SyncEngine, owner: &str, command: Command) -> Result<()> {
  match command {
    Command::List {
      resource,
      conditions,
    } => {
      let filter = conditions
        .into_iter()
        .fold(Filter::new(), |f, (field, value)| f.where_eq(field, value));
      let scope = ScopeKey::new(resource, owner).with_filter(filter);
      let mut handle = engine.use_scope(scope, true);
      let view = handle.settled().await?;
      print_view(resource, &view);
    }

    Command::AddTask { title, due } => {
      let mut payload = json!({ "title": title, "done": false });
      if let Some(due) = due {
        payload["due_on"] = Value::String(due);
      }
      let scope = ScopeKey::new(ResourceKind::Task, owner);
      let committed = engine.mutate(&scope, Mutation::create(payload)?).await?;
      print_saved(ResourceKind::Task, committed.record());
    }

    Command::AddEntry {
      amount,
      income,
      category,
      note,
    } => {
      if !amount.is_finite() || amount <= 0.0 {
        return Err(eyre!("Amount must be a positive number"));
      }
      let kind = if income { EntryKind::Income } else { EntryKind::Expense };
      let mut payload = Map::new();
      payload.insert("amount".into(), json!(amount));
      payload.insert("type".into(), serde_json::to_value(kind)?);
      payload.insert("occurred_on".into(), json!(chrono::Local::now().date_naive().to_string()));
      if let Some(category) = category {
        payload.insert("category_id".into(), json!(RecordId::parse(category)));
      }
      if let Some(note) = note {
        payload.insert("note".into(), Value::String(note));
      }
      let scope = ScopeKey::new(ResourceKind::LedgerEntry, owner);
      let committed = engine.mutate(&scope, Mutation::create(Value::Object(payload))?).await?;
      print_saved(ResourceKind::LedgerEntry, committed.record());
    }

    Command::Toggle { id } => {
      let id = RecordId::parse(id);
      let scope = ScopeKey::new(ResourceKind::Task, owner);
      let mut handle = engine.use_scope(scope, true);
      let view = handle.settled().await?;
      let current = view
        .data
        .as_ref()
        .and_then(|d| d.find(&id))
        .ok_or_else(|| eyre!("No task {} for {}", id, owner))?
        .get_bool("done")
        .unwrap_or(false);
      let committed = handle.mutate(Mutation::toggle(id, current)).await?;
      print_saved(ResourceKind::Task, committed.record());
    }

    Command::Delete { resource, id } => {
      let scope = ScopeKey::new(resource, owner);
      let committed = engine.mutate(&scope, Mutation::delete(RecordId::parse(id))).await?;
      println!("deleted {} {}", resource, committed.id());
    }

    Command::Watch { resource } => {
      let scope = ScopeKey::new(resource, owner);
      let label = scope.to_string();
      let mut handle = engine.use_scope(scope, true);
      let ctrl_c = tokio::signal::ctrl_c();
      tokio::pin!(ctrl_c);

      loop {
        tokio::select! {
          changed = handle.changed() => {
            let view = changed?;
            if !view.is_loading() {
              println!("--- {} ({:?}) ---", label, view.status);
              print_view(resource, &view);
            }
          }
          _ = &mut ctrl_c => break,
        }
      }
    }
  }

  Ok(())
}

fn print_view(resource: ResourceKind, view: &ScopeView) {
  if let Some(err) = &view.error {
    eprintln!("warning: showing cached data, last refresh failed: {}", err);
  }
  if view.records().is_empty() {
    println!("(no {} rows)", resource);
  }
  for record in view.records() {
    println!("{}", render(resource, record));
  }
}

fn print_saved(resource: ResourceKind, record: Option<&Record>) {
  if let Some(record) = record {
    println!("{}", render(resource, record));
  }
}

/// One line per record; rows the typed view cannot decode are shown raw.
fn render(resource: ResourceKind, record: &Record) -> String {
  let line = match resource {
    ResourceKind::Task => record.decode::<Task>().map(|t| {
      let mark = if t.done { "x" } else { " " };
      match t.due_on {
        Some(due) => format!("[{}] {:>6}  {}  (due {})", mark, t.id, t.title, due),
        None => format!("[{}] {:>6}  {}", mark, t.id, t.title),
      }
    }),
    ResourceKind::LedgerEntry => record.decode::<LedgerEntry>().map(|e| {
      let signed = match e.kind {
        EntryKind::Income => e.amount,
        EntryKind::Expense => -e.amount,
      };
      format!(
        "{:>6}  {:>10.2}  {}  {}",
        e.id,
        signed,
        e.occurred_on.unwrap_or_default(),
        e.note.unwrap_or_default()
      )
    }),
    ResourceKind::Category => record
      .decode::<Category>()
      .map(|c| format!("{:>6}  {}  {}", c.id, c.name, c.color.unwrap_or_default())),
    ResourceKind::Profile => record.decode::<Profile>().map(|p| {
      format!(
        "{}  {}  {}",
        p.id,
        p.display_name.unwrap_or_default(),
        p.currency.unwrap_or_default()
      )
    }),
  };

  line.unwrap_or_else(|_| format!("{:>6}  {}", record.id, Value::Object(record.fields.clone())))
}
