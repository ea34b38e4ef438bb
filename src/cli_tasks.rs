use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use savebot_agent::task_store::{SqliteTaskStore, TaskState, TaskStatus, TaskStore};
use savebot_agent::tasks::TransferPayload;

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::from_db_str(&s.to_lowercase()).ok_or_else(|| {
        let valid: Vec<&str> = TaskStatus::ALL.iter().map(|s| s.as_db_str()).collect();
        format!("unknown status '{}', expected one of {}", s, valid.join(", "))
    })
}

#[derive(Parser, Debug)]
#[command(about = "Inspect and edit the agent's task database")]
struct CliArgs {
    /// Path to the task database file.
    #[clap(value_parser = parse_path)]
    pub db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists tasks, newest first.
    List {
        #[clap(long, value_parser = parse_status)]
        status: Option<TaskStatus>,

        #[clap(long, default_value_t = 50)]
        limit: usize,
    },

    /// Shows every field of a task.
    Show { id: String },

    /// Shows the audit trail of a task.
    Events {
        id: String,

        #[clap(long, default_value_t = 100)]
        limit: usize,
    },

    /// Deletes a task and its audit trail.
    Delete { id: String },

    /// Records a pending task. The agent picks it up on its next store rescan.
    Enqueue {
        #[clap(long, default_value = "http")]
        kind: String,

        #[clap(long)]
        source: String,

        #[clap(long)]
        dest: String,

        #[clap(long)]
        title: Option<String>,
    },
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_task_row(task: &TaskState) {
    println!(
        "{:<36}  {:<9}  {:<6}  {:<19}  {}",
        task.id,
        task.status,
        task.kind,
        format_millis(task.created_at),
        task.title
    );
}

fn print_task_details(task: &TaskState) {
    println!("id:           {}", task.id);
    println!("title:        {}", task.title);
    println!("kind:         {}", task.kind);
    println!("status:       {}", task.status);
    println!("created_at:   {}", format_millis(task.created_at));
    println!("updated_at:   {}", format_millis(task.updated_at));
    match task.completed_at {
        Some(at) => println!("completed_at: {}", format_millis(at)),
        None => println!("completed_at: -"),
    }
    if !task.error.is_empty() {
        println!("error:        {}", task.error);
    }
    match TransferPayload::decode(&task.payload) {
        Ok(payload) => {
            println!("source:       {}", payload.source);
            println!("destination:  {}", payload.destination);
        }
        Err(_) => println!("payload:      {} opaque bytes", task.payload.len()),
    }
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    if !cli_args.db_path.exists() {
        bail!("Task database not found at {:?}", cli_args.db_path);
    }
    let store = SqliteTaskStore::new(&cli_args.db_path)
        .with_context(|| format!("Failed to open task database {:?}", cli_args.db_path))?;

    match cli_args.command {
        Command::List { status, limit } => {
            let tasks = store.list(status, limit)?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                print_task_row(task);
            }
        }
        Command::Show { id } => {
            let task = store.get(&id)?;
            print_task_details(&task);
        }
        Command::Events { id, limit } => {
            store.get(&id)?;
            let events = store.events_for(&id, limit)?;
            if events.is_empty() {
                println!("No events recorded for {}.", id);
            }
            for event in events {
                let details = event
                    .details
                    .map(|d| d.to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {:<15}  {}",
                    format_millis(event.timestamp),
                    event.event_type.as_str(),
                    details
                );
            }
        }
        Command::Delete { id } => {
            let task = store.get(&id)?;
            if task.status == TaskStatus::Running {
                bail!("Task {} is running, cancel it through the agent first", id);
            }
            store.delete(&id)?;
            println!("Deleted task {}.", id);
        }
        Command::Enqueue {
            kind,
            source,
            dest,
            title,
        } => {
            let title = title.unwrap_or_else(|| dest.clone());
            let payload = TransferPayload::new(source, dest);
            let task = TaskState::new_pending(kind, payload.encode(), title);
            store.put(&task)?;
            println!("Enqueued task {}.", task.id);
        }
    }

    Ok(())
}
